use proptest::prelude::*;

prop_compose! {
    pub(crate) fn arb_file_record()(
        id in any::<u64>(),
        name in "[!-~][ -~]{0,24}",
    ) -> String {
        format!("FILE {} {}", id, name)
    }
}

prop_compose! {
    pub(crate) fn arb_func_record()(
        address in any::<u64>(),
        size in any::<u64>(),
        name in "[!-~][ -~]{0,32}",
    ) -> String {
        format!("FUNC {:x} {:x} {}", address, size, name)
    }
}

prop_compose! {
    pub(crate) fn arb_line_record()(
        address in any::<u64>(),
        size in any::<u64>(),
        line in 1..=i64::MAX,
        file_id in any::<u64>(),
    ) -> String {
        format!("{:x} {:x} {} {}", address, size, line, file_id)
    }
}

prop_compose! {
    pub(crate) fn arb_stack_win_record()(
        ty in 0u64..5,
        address in any::<u64>(),
        size in any::<u64>(),
        prolog_size in any::<u32>(),
        epilog_size in any::<u32>(),
        parameter_size in any::<u32>(),
        saved_register_size in any::<u32>(),
        local_size in any::<u32>(),
        max_stack_size in any::<u32>(),
        program_string in "[!-~][ -~]{0,40}",
    ) -> String {
        format!(
            "STACK WIN {:x} {:x} {:x} {:x} {:x} {:x} {:x} {:x} {:x} {}",
            ty,
            address,
            size,
            prolog_size,
            epilog_size,
            parameter_size,
            saved_register_size,
            local_size,
            max_stack_size,
            program_string
        )
    }
}
