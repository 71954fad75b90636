use std::sync::Once;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

pub fn init_test_logging() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));

        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_test_writer()
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_thread_ids(true)
                    .json(),
            )
            .with(filter)
            .init();
    });
}

#[allow(dead_code)]
pub fn fixture(name: &str) -> &'static str {
    match name {
        "proc_stat_sample.txt" => include_str!("../fixtures/proc_stat_sample.txt"),
        "proc_stat_next.txt" => include_str!("../fixtures/proc_stat_next.txt"),
        "port_feed_sample.txt" => include_str!("../fixtures/port_feed_sample.txt"),
        other => panic!("unknown fixture: {other}"),
    }
}
