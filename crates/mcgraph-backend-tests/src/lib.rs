pub mod api_invariants;
pub mod recording_device;
pub mod smoke;

pub use recording_device::RecordingDevice;

#[macro_export]
macro_rules! define_device_tests {
    ($module:ident, $device_ctor:expr) => {
        $crate::define_device_tests!($module, $device_ctor, available = true);
    };
    ($module:ident, $device_ctor:expr, available = $available:expr) => {
        #[cfg(test)]
        mod $module {
            #[allow(unused_imports)]
            use super::*;

            use $crate::{api_invariants, smoke};

            macro_rules! device_test {
                ($name:ident, $func:path) => {
                    #[test]
                    fn $name() {
                        if !($available) {
                            eprintln!("skipping {}: device unavailable", stringify!($name));
                            return;
                        }
                        let device = ($device_ctor)();
                        $func(&device);
                    }
                };
            }

            device_test!(smoke_scenario_expectation_is_five, smoke::scenario_expectation_is_five);
            device_test!(smoke_elementwise_ops_match_reference, smoke::elementwise_ops_match_reference);
            device_test!(smoke_expectation_respects_filter, smoke::expectation_respects_filter);
            device_test!(smoke_conditional_expectation_matches_ols, smoke::conditional_expectation_matches_ols);
            device_test!(smoke_conditional_expectation_with_empty_filter_is_zero, smoke::conditional_expectation_with_empty_filter_is_zero);
            device_test!(smoke_deep_out_of_the_money_put_is_worthless, smoke::deep_out_of_the_money_put_is_worthless);
            device_test!(smoke_bermudan_put_matches_reference, smoke::bermudan_put_matches_reference);
            device_test!(smoke_batched_sync_nodes_match_reference, smoke::batched_sync_nodes_match_reference);
            device_test!(api_cached_chain_is_reused, api_invariants::cached_chain_is_reused);
            device_test!(api_cached_chain_checks_input_layout, api_invariants::cached_chain_checks_input_layout);
            device_test!(api_version_change_rebuilds, api_invariants::version_change_rebuilds);
            device_test!(api_variate_prefix_is_stable, api_invariants::variate_prefix_is_stable);
            device_test!(api_disposed_slot_rejects_reuse, api_invariants::disposed_slot_rejects_reuse);
            device_test!(api_failed_finalize_returns_to_idle, api_invariants::failed_finalize_returns_to_idle);
            device_test!(api_state_machine_rejects_out_of_order_calls, api_invariants::state_machine_rejects_out_of_order_calls);
            device_test!(api_schedule_launches_in_order, api_invariants::schedule_launches_in_order);
            device_test!(api_framework_resolves_device_names, api_invariants::framework_resolves_device_names);
        }
    };
}
