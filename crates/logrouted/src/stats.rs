//! Periodic statistics series.

use crate::router::Router;
use crate::server::SessionServer;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Runs the statistics loop until `stop` is set: one series per period over
/// all sources and channels, flushing the channel staging buffers so
/// sparse traffic never ages in the daemon.
pub fn run_stats_loop(
    router: &Arc<Router>,
    server: &SessionServer,
    period: Duration,
    stop: &AtomicBool,
) {
    let mut series: u16 = 0;
    let mut next = Instant::now() + period;

    while !stop.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
        if Instant::now() < next {
            continue;
        }
        next += period;
        series = series.wrapping_add(1);

        server.show_source_statistics(series);
        router.show_channel_statistics(series, period.as_secs());
        router.flush_all();
    }
}
