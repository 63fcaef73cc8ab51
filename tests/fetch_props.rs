use aero_fetch::{
    AddressTranslation, DenseMemory, DispatchConfig, FetchCpu, GuestMemory, SegmentFault,
    StepError,
};
use proptest::prelude::*;

const MEMORY_SIZE: u64 = 0x12_0000;

fn arb_code() -> impl Strategy<Value = Vec<u8>> {
    // Mostly single-byte and short instructions so blocks regularly run into the wrap point.
    let byte = prop_oneof![
        4 => Just(0x90u8),
        1 => Just(0x40u8),
        1 => Just(0xB8u8),
        1 => Just(0x66u8),
        1 => any::<u8>(),
    ];
    proptest::collection::vec(byte, 1..24)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn real_mode_blocks_stay_inside_the_code_segment(
        selector in any::<u16>(),
        ip in 0xFFE0u16..=0xFFFF,
        code in arb_code(),
        wrapped in proptest::collection::vec(any::<u8>(), 16),
    ) {
        let mut memory = DenseMemory::new(MEMORY_SIZE).unwrap();
        let base = u64::from(selector) << 4;
        memory.write_from(base, &wrapped).unwrap();
        memory.write_from(base + u64::from(ip), &code).unwrap();

        let mut cpu = FetchCpu::new(memory, DispatchConfig::default());
        cpu.jump_real(selector, ip).unwrap();

        match cpu.fetch_block() {
            Ok(block) => {
                prop_assert_eq!(block.ip(), u32::from(ip));
                prop_assert_eq!(block.linear_address(), base + u64::from(ip));
                let end_ip = u64::from(block.ip()) + u64::from(block.len());
                prop_assert!(end_ip <= 0x1_0000);

                // Each instruction's bytes are the ones at CS:op.ip.
                let mut offset = 0u64;
                for op in block.ops() {
                    prop_assert_eq!(u64::from(op.ip), u64::from(ip) + offset);
                    let linear = cpu.code_segment().translate_address_read(op.ip).unwrap();
                    prop_assert_eq!(u64::from(linear), block.linear_address() + offset);
                    offset += u64::from(op.len);
                }
            }
            Err(StepError::Fault(fault)) => {
                prop_assert_eq!(fault, SegmentFault::GeneralProtection { code: 0x1_0000 });
            }
            Err(err) => {
                prop_assert!(matches!(err, StepError::InvalidOpcode { .. }), "{}", err);
            }
        }
    }
}
