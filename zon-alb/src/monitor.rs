use crate::alb::Alb;
use std::{sync::Arc, time::Duration};
use tokio::{
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};

/// Drives the periodic work of the bond until the task is aborted.
pub fn spawn(alb: Arc<Alb>) -> JoinHandle<()> {
    let ticks = alb.timers().ticks_per_sec.max(1);
    let period = Duration::from_secs(1) / ticks;

    tokio::spawn(async move {
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        interval.tick().await;

        log::info!("[mon] {} ticking every {:?}", alb.name(), period);
        loop {
            interval.tick().await;
            alb.monitor_tick();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{alb::AlbTimers, sim::SimLink, stats::stat};

    #[tokio::test(start_paused = true)]
    async fn sends_learning_packets_every_interval() {
        let alb = Arc::new(Alb::new("bond0", [0x02, 0, 0, 0, 0, 1], AlbTimers::default(), true).unwrap());
        let dev = Arc::new(SimLink::new("eth0"));
        alb.attach("eth0", 1000, [0x02, 0, 0, 0, 0, 2], dev.clone())
            .unwrap();
        let sent = alb.stats().get(stat::LP_SENT);

        let mon = spawn(alb.clone());
        time::sleep(Duration::from_millis(1050)).await;
        assert_eq!(alb.stats().get(stat::LP_SENT), sent + 1);
        assert_eq!(alb.stats().get(stat::TLB_REBALANCES), 1);

        mon.abort();
        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(alb.stats().get(stat::LP_SENT), sent + 1);
    }
}
