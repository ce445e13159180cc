//! Event router - wires serial and config events into the session registry
//!
//! Each subscription gets its own consumer task that handles events strictly
//! in arrival order. Consumers exit on the shared shutdown signal (polled
//! first) or when their channel closes.

use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::CanonicalConfig;
use crate::serial::SliderMoveEvent;
use crate::session::SessionRegistry;

pub struct EventRouter {
    shutdown: watch::Sender<bool>,
    consumers: Vec<JoinHandle<()>>,
}

impl EventRouter {
    /// Spawn the slider-move and config-reload consumers
    pub fn start(
        registry: Arc<SessionRegistry>,
        slider_moves: mpsc::Receiver<SliderMoveEvent>,
        config_reloads: mpsc::Receiver<Arc<CanonicalConfig>>,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);

        let consumers = vec![
            tokio::spawn(consume_slider_moves(
                Arc::clone(&registry),
                slider_moves,
                shutdown_rx.clone(),
            )),
            tokio::spawn(consume_config_reloads(registry, config_reloads, shutdown_rx)),
        ];

        info!("🔀 Event router started");
        Self {
            shutdown,
            consumers,
        }
    }

    /// Receiver for the router's shutdown signal, for tasks that stop with it
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Signal every consumer to stop and wait for them
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);

        for consumer in self.consumers {
            if let Err(e) = consumer.await {
                warn!("Event consumer ended abnormally: {}", e);
            }
        }
        debug!("Event router stopped");
    }
}

async fn consume_slider_moves(
    registry: Arc<SessionRegistry>,
    mut events: mpsc::Receiver<SliderMoveEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            event = events.recv() => {
                let Some(event) = event else { break };
                debug!(
                    "Slider {} moved to {:.2}",
                    event.slider_id, event.percent_value
                );
                registry.on_slider_move(&event).await;
            }
        }
    }
    debug!("Slider move consumer stopped");
}

async fn consume_config_reloads(
    registry: Arc<SessionRegistry>,
    mut reloads: mpsc::Receiver<Arc<CanonicalConfig>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            reload = reloads.recv() => {
                if reload.is_none() {
                    break;
                }
                registry.on_config_reload().await;
            }
        }
    }
    debug!("Config reload consumer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigHandle;
    use crate::session::foreground::UnsupportedForeground;
    use crate::session::{ConsoleSessionFinder, CooldownForeground};
    use std::time::Duration;

    fn setup() -> (Arc<ConsoleSessionFinder>, ConfigHandle, Arc<SessionRegistry>) {
        let finder = Arc::new(ConsoleSessionFinder::with_default_sessions());
        let config = ConfigHandle::new(CanonicalConfig::default());
        let registry = Arc::new(SessionRegistry::new(
            finder.clone(),
            config.clone(),
            Arc::new(CooldownForeground::new(Arc::new(UnsupportedForeground))),
        ));
        (finder, config, registry)
    }

    #[tokio::test]
    async fn test_slider_moves_reach_registry() {
        let (finder, config, registry) = setup();
        registry.initialize().await.unwrap();

        let (tx, rx) = mpsc::channel(1);
        let router = EventRouter::start(registry, rx, config.subscribe_to_changes());

        tx.send(SliderMoveEvent {
            slider_id: 0,
            percent_value: 0.42,
        })
        .await
        .unwrap();
        drop(tx);

        // the channel closing ends the consumer after the event is handled
        tokio::time::sleep(Duration::from_millis(50)).await;
        router.shutdown().await;

        assert_eq!(finder.volume_of("master"), Some(0.42));
    }

    #[tokio::test(start_paused = true)]
    async fn test_config_reload_triggers_soft_refresh() {
        let (finder, config, registry) = setup();
        registry.initialize().await.unwrap();

        let (_tx, rx) = mpsc::channel(1);
        let router = EventRouter::start(registry, rx, config.subscribe_to_changes());

        tokio::time::advance(Duration::from_secs(6)).await;
        config.apply(CanonicalConfig::default()).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(finder.discovery_count(), 2);
        router.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_config_reload_within_cooldown_skips_refresh() {
        let (finder, config, registry) = setup();
        registry.initialize().await.unwrap();

        let (_tx, rx) = mpsc::channel(1);
        let router = EventRouter::start(registry, rx, config.subscribe_to_changes());

        tokio::time::advance(Duration::from_secs(2)).await;
        config.apply(CanonicalConfig::default()).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(finder.discovery_count(), 1);
        router.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_idle_consumers() {
        let (_finder, config, registry) = setup();
        let (_tx, rx) = mpsc::channel(1);
        let router = EventRouter::start(registry, rx, config.subscribe_to_changes());
        let mut signal = router.shutdown_signal();

        router.shutdown().await;

        assert!(*signal.borrow_and_update());
    }
}
