use super::Frontend;
use anyhow::Result;
use tracing_subscriber::{
    filter::LevelFilter,
    fmt::{format::FmtSpan, Layer as FmtLayer},
    layer::SubscriberExt as _,
    Layer as _, Registry,
};

/// Plain log lines on stderr.
pub(crate) struct HeadlessLogger {}

impl Frontend for HeadlessLogger {
    fn set_up(&mut self, options: &super::Options) -> Result<()> {
        let level = if options.verbose {
            tracing::Level::TRACE
        } else {
            tracing::Level::INFO
        };

        let span_events = if options.verbose {
            // include enter/exit events for detailed tracing
            FmtSpan::FULL
        } else {
            // announce what we do and when we're done
            FmtSpan::NEW | FmtSpan::CLOSE
        };

        let fmt_layer = FmtLayer::new()
            .with_writer(std::io::stderr)
            .with_span_events(span_events)
            .with_target(options.verbose)
            .with_ansi(options.color)
            .with_filter(LevelFilter::from_level(level));
        let subscriber = Registry::default().with(fmt_layer);

        tracing::subscriber::set_global_default(subscriber)
            .map_err(|e| anyhow::anyhow!("failed to set up tracing: {}", e))?;

        Ok(())
    }

    fn tear_down(&mut self) -> Result<()> {
        Ok(())
    }
}
