//! Scheduler end-to-end suite.

use catos_abi::task::ProcessState;
use catos_lib::testing::TestResult;
use catos_lib::{assert_test, define_test_suite, fail, pass};

use super::{reset_kernel_state, spawn_user_task};
use crate::sched::{
    scheduler_block_current, scheduler_get_current, scheduler_handle_post_irq,
    scheduler_is_queued, scheduler_ready_count, scheduler_tick, scheduler_unblock_process,
    scheduler_yield, TIME_QUANTUM,
};

fn test_round_robin_rotation() -> TestResult {
    reset_kernel_state();
    let a = spawn_user_task();
    let b = spawn_user_task();
    let c = spawn_user_task();
    assert_test!(!a.is_null() && !b.is_null() && !c.is_null(), "spawn tasks");

    let mut order = [core::ptr::null_mut(); 6];
    for slot in order.iter_mut() {
        scheduler_yield();
        *slot = scheduler_get_current();
    }
    assert_test!(order[0] == a && order[1] == b && order[2] == c, "first lap fifo");
    assert_test!(order[3] == a && order[4] == b && order[5] == c, "second lap fifo");
    pass!()
}

fn test_block_unblock_cycle() -> TestResult {
    reset_kernel_state();
    let a = spawn_user_task();
    let b = spawn_user_task();
    scheduler_yield();
    assert_test!(scheduler_get_current() == a, "a runs first");

    scheduler_block_current();
    // SAFETY: live PCB.
    assert_test!(
        unsafe { (*a).state() } == ProcessState::Blocked,
        "a blocked"
    );
    assert_test!(!scheduler_is_queued(a), "blocked task off the queue");
    assert_test!(scheduler_get_current() == b, "b took over");

    scheduler_unblock_process(a);
    assert_test!(scheduler_is_queued(a), "a re-queued at tail");
    assert_test!(scheduler_ready_count() == 1, "one ready task");

    scheduler_yield();
    assert_test!(scheduler_get_current() == a, "a resumes");
    pass!()
}

fn test_quantum_preemption_budget() -> TestResult {
    reset_kernel_state();
    let a = spawn_user_task();
    let b = spawn_user_task();
    scheduler_yield();

    for _ in 0..10 * TIME_QUANTUM {
        scheduler_tick();
        scheduler_handle_post_irq();
    }

    // SAFETY: live PCBs.
    let (time_a, time_b) = unsafe { ((*a).cpu_time, (*b).cpu_time) };
    if time_a + time_b != 10 * TIME_QUANTUM {
        return fail!("lost ticks: {} + {}", time_a, time_b);
    }
    if time_a.abs_diff(time_b) > 1 {
        return fail!("unfair split: {} vs {}", time_a, time_b);
    }
    pass!()
}

define_test_suite!(
    sched_e2e,
    [
        test_round_robin_rotation,
        test_block_unblock_cycle,
        test_quantum_preemption_budget,
    ]
);
