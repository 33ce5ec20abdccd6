//! Logging initialization, lifted verbatim in spirit from the teacher's
//! `main()` tracing setup.

pub fn init() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("race_poller=info".parse().unwrap()),
        )
        .init();
}
