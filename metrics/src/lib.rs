use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_histogram, register_int_gauge, Counter,
    CounterVec, Histogram, IntGauge,
};
use std::time::Duration;

lazy_static! {
    // Main loop metrics
    pub static ref TICK_COUNT: Counter = register_counter!(
        "conveyor_tick_count",
        "the number of scheduling ticks run"
    )
    .unwrap();
    pub static ref TICK_FAILURE_COUNT: Counter = register_counter!(
        "conveyor_tick_failure_count",
        "the number of scheduling ticks that failed"
    )
    .unwrap();
    pub static ref TICK_DURATION_SECONDS: Histogram = register_histogram!(
        "conveyor_tick_duration_seconds",
        "wall time of one scheduling tick"
    )
    .unwrap();

    // Queue metrics
    pub static ref QUEUE_SIZE: IntGauge = register_int_gauge!(
        "conveyor_queue_size",
        "candidates left in the queue after matching"
    )
    .unwrap();
    pub static ref CANDIDATE_COUNT: CounterVec = register_counter_vec!(
        "conveyor_candidate_count",
        "candidates seen per tick, by disposition",
        &["disposition"]
    )
    .unwrap();

    // Dispatch metrics
    pub static ref DISPATCH_COUNT: CounterVec = register_counter_vec!(
        "conveyor_dispatch_count",
        "dispatch attempts, by outcome",
        &["outcome"]
    )
    .unwrap();

    // Job metrics
    pub static ref JOB_CREATED_COUNT: CounterVec = register_counter_vec!(
        "conveyor_job_created_count",
        "jobs materialized, by origin",
        &["origin"]
    )
    .unwrap();
}

pub fn observe_tick_duration(elapsed: Duration) {
    TICK_DURATION_SECONDS.observe(elapsed.as_secs_f64());
}
