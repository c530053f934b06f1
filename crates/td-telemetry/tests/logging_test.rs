use td_telemetry::logging::{init, init_logging, init_logging_json};

#[test]
fn repeated_initialisation_is_harmless() {
    init_logging("td-test", "debug");
    init_logging("td-test", "info");
    init_logging_json("td-test", "info");
    init("td-test", "not a [valid filter", false);
    tracing::info!("still logging");
}
