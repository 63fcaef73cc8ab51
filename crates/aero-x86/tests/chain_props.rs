use std::sync::{Arc, Mutex};

use aero_x86::decoder::BasicOp;
use aero_x86::{
    ByteSource, CodeBlock, CodeBlockFactory, CpuMode, DecodeAbort, DecodeError, DecodedOp,
    FactoryChain, Op,
};
use memory::{DenseMemory, GuestMemoryError};
use proptest::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Abort,
    Succeed,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Attempt {
    factory: usize,
    bound: bool,
    start: u64,
    consumed: u64,
    first_byte: Option<u8>,
}

struct Scripted {
    index: usize,
    outcome: Outcome,
    consume: usize,
    log: Arc<Mutex<Vec<Attempt>>>,
}

impl CodeBlockFactory for Scripted {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn decode(&self, source: &mut ByteSource<'_>, ip: u32) -> Result<CodeBlock, DecodeError> {
        self.log.lock().unwrap().push(Attempt {
            factory: self.index,
            bound: source.is_bound(),
            start: source.start_address(),
            consumed: source.consumed(),
            first_byte: source.peek_byte(0).ok(),
        });
        for _ in 0..self.consume {
            let _ = source.next_byte();
        }
        match self.outcome {
            Outcome::Abort => Err(DecodeAbort::UnsupportedOpcode { opcode: 0 }.into()),
            Outcome::Fail => Err(GuestMemoryError::OutOfRange {
                paddr: 0,
                len: 1,
                size: 0,
            }
            .into()),
            Outcome::Succeed => {
                let op = DecodedOp {
                    ip,
                    len: 1,
                    op: Op::Basic(BasicOp::Nop),
                };
                CodeBlock::new(source.start_address(), CpuMode::Real, vec![op])
                    .ok_or_else(|| DecodeAbort::InvalidInstruction.into())
            }
        }
    }
}

fn build_chain(
    outcomes: &[Outcome],
    consume: &[usize],
) -> (FactoryChain, Arc<Mutex<Vec<Attempt>>>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut chain = FactoryChain::new();
    for (index, (&outcome, &consume)) in outcomes.iter().zip(consume).enumerate() {
        chain.push(Scripted {
            index,
            outcome,
            consume,
            log: Arc::clone(&log),
        });
    }
    (chain, log)
}

fn outcomes_with_first(n: usize, first: Option<(usize, Outcome)>) -> Vec<Outcome> {
    (0..n)
        .map(|i| match first {
            Some((k, outcome)) if i == k => outcome,
            // Anything after the deciding factory must never run; make it succeed so a stray
            // attempt would change the result.
            Some((k, _)) if i > k => Outcome::Succeed,
            _ => Outcome::Abort,
        })
        .collect()
}

fn arb_case() -> impl Strategy<Value = (Vec<Outcome>, Vec<usize>)> {
    (1usize..8).prop_flat_map(|n| {
        let decider = prop_oneof![
            Just(None),
            (0..n, prop_oneof![Just(Outcome::Succeed), Just(Outcome::Fail)]).prop_map(Some),
        ];
        (
            decider.prop_map(move |first| outcomes_with_first(n, first)),
            proptest::collection::vec(0usize..6, n),
        )
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn every_attempt_sees_the_same_initial_state(
        (outcomes, consume) in arb_case(),
        linear in 0u64..0x30,
    ) {
        let bytes: Vec<u8> = (0..0x40u8).collect();
        let mem = DenseMemory::from_bytes(&bytes);
        let (chain, log) = build_chain(&outcomes, &consume);

        let mut source = ByteSource::detached();
        let result = chain.decode(&mut source, &mem, linear, linear as u32);
        prop_assert!(!source.is_bound());

        let decider = outcomes.iter().position(|&o| o != Outcome::Abort);
        let attempts = log.lock().unwrap();
        let expected_attempts = decider.map_or(outcomes.len(), |k| k + 1);
        prop_assert_eq!(attempts.len(), expected_attempts);

        for (i, attempt) in attempts.iter().enumerate() {
            prop_assert_eq!(
                attempt,
                &Attempt {
                    factory: i,
                    bound: true,
                    start: linear,
                    consumed: 0,
                    first_byte: Some(bytes[linear as usize]),
                }
            );
        }

        match decider.map(|k| outcomes[k]) {
            None => prop_assert_eq!(result, Ok(None)),
            Some(Outcome::Succeed) => {
                let block = result.unwrap().unwrap();
                prop_assert_eq!(block.linear_address(), linear);
            }
            Some(_) => prop_assert!(matches!(result, Err(DecodeError::Memory(_)))),
        }
    }
}

#[test]
fn exhausted_chain_leaves_source_detached() {
    // lea ax, ax is not a valid encoding for either stock decoder.
    let mem = DenseMemory::from_bytes(&[0x8D, 0xC0, 0x8D, 0xC0]);
    let chain = FactoryChain::for_mode(CpuMode::Real, &Default::default());

    let mut source = ByteSource::detached();
    assert_eq!(chain.decode(&mut source, &mem, 0, 0), Ok(None));
    assert!(!source.is_bound());

    let mem = DenseMemory::from_bytes(&[0x90, 0xF4]);
    let block = chain.decode(&mut source, &mem, 0, 0).unwrap().unwrap();
    assert_eq!(block.instruction_count(), 2);
    assert!(!source.is_bound());
}

#[test]
fn empty_chain_produces_no_block() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::TRACE)
        .try_init();

    let mem = DenseMemory::from_bytes(&[0x90]);
    let mut source = ByteSource::detached();
    assert_eq!(
        FactoryChain::new().decode(&mut source, &mem, 0, 0),
        Ok(None)
    );
}
