//! PubSub Substrate.
//!
//! [`Publisher`] and [`Subscriber`] are the uniform facades over a [`Broker`].
//! Both go through the Authorization Gate. The [`Supervisor`] owns the broker
//! connection and the recovery queue that keeps data messages through broker
//! outages.
//!
//! [`Broker`]: crate::broker::Broker

pub use self::publisher::Publisher;
pub use self::subscriber::{
    handler_fn, MessageHandler, SubscribeOptions, Subscriber, Subscription, SubscriptionStats,
};
pub use self::supervisor::{Bound, ConnState, Supervisor};

pub mod publisher;
pub mod subscriber;
pub mod supervisor;

#[cfg(test)]
mod tests {
    use std::str::FromStr;
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::sync::{mpsc, watch};

    use mfabric_conf::{Auth, PubSub as PubSubConfig, SigningKey};

    use super::*;
    use crate::auth::{AuthGate, Credential, MemoryPolicyOracle, MemoryThingRepository};
    use crate::broker::MemoryBroker;
    use crate::message::Limits;
    use crate::queue::RecoveryQueue;
    use crate::topic::{Pattern, Router};
    use crate::types::{Message, SubjectType};
    use crate::FabricError;

    struct Fixture {
        broker: Arc<MemoryBroker>,
        supervisor: Arc<Supervisor>,
        publisher: Publisher,
        subscriber: Subscriber,
        cred: Credential,
        _stop: watch::Sender<bool>,
    }

    fn fixture(cfg: PubSubConfig) -> Fixture {
        let mut auth = Auth::default();
        auth.token.active_key = SigningKey { id: "k1".into(), secret: "s1".into() };
        let oracle = Arc::new(MemoryPolicyOracle::new());
        oracle.set_owner("ch1", "u1");
        let gate = Arc::new(AuthGate::new(auth, oracle, Arc::new(MemoryThingRepository::new())));
        let cred = Credential::Bearer(gate.issue_token("u1", SubjectType::User, &[]).unwrap());

        let broker = Arc::new(MemoryBroker::new());
        let queue = Arc::new(RecoveryQueue::new(cfg.recovery_queue_capacity));
        let supervisor = Arc::new(Supervisor::new(broker.clone(), broker.clone(), queue, cfg));
        let (stop, stop_rx) = watch::channel(false);
        tokio::spawn(supervisor.clone().run(stop_rx));

        let router = Router::default();
        let publisher = Publisher::new(gate.clone(), supervisor.clone(), router.clone(), Limits::default());
        let subscriber = Subscriber::new(gate, supervisor.clone(), router);
        Fixture { broker, supervisor, publisher, subscriber, cred, _stop: stop }
    }

    fn fast() -> PubSubConfig {
        let mut cfg = PubSubConfig::default();
        cfg.reconnect_initial = Duration::from_millis(10);
        cfg.reconnect_max = Duration::from_millis(50);
        cfg
    }

    fn collect(tx: mpsc::UnboundedSender<Message>) -> MessageHandler {
        handler_fn(move |m| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(m);
                Ok(())
            }
        })
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
        tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn publish_reaches_matching_subscriber() {
        let f = fixture(fast());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pattern = Pattern::from_str("ch1.temp.*").unwrap();
        let sub = f.subscriber.subscribe(&f.cred, &pattern, SubscribeOptions::default(), collect(tx)).await.unwrap();

        f.publisher.publish(&f.cred, "ch1", "temp.room1", Bytes::from_static(&[0x7b]), "http").await.unwrap();
        f.publisher.publish(&f.cred, "ch1", "hum.room1", Bytes::from_static(&[0x7c]), "http").await.unwrap();

        let m = recv(&mut rx).await;
        assert_eq!(m.publisher, "u1");
        assert_eq!(m.subtopic, "temp.room1");
        assert!(m.created > 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(sub.stats().delivered, 1);
        sub.unsubscribe().await.unwrap();
        assert_eq!(f.supervisor.registrations(), 0);
    }

    #[tokio::test]
    async fn unauthorized_subscribe_hides_channel() {
        let f = fixture(fast());
        let (tx, _rx) = mpsc::unbounded_channel();
        let pattern = Pattern::from_str("ch2.>").unwrap();
        let res = f.subscriber.subscribe(&f.cred, &pattern, SubscribeOptions::default(), collect(tx)).await;
        assert!(matches!(res, Err(FabricError::NotFound)));
    }

    #[tokio::test]
    async fn invalid_message_is_rejected_before_auth() {
        let f = fixture(fast());
        let res = f.publisher.publish(&f.cred, "ch1", "a..b", Bytes::new(), "http").await;
        assert!(matches!(res, Err(FabricError::InvalidSubtopic(_))));
        let res = f.publisher.publish(&Credential::Bearer("x.y.z".into()), "ch1", "a", Bytes::new(), "http").await;
        assert!(matches!(res, Err(FabricError::Unauthenticated(_))));
        assert_eq!(f.broker.writes("m.ch1.a"), 0);
    }

    #[tokio::test]
    async fn outage_keeps_publish_order() {
        let mut cfg = fast();
        cfg.recovery_queue_capacity = 10;
        let f = fixture(cfg);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pattern = Pattern::from_str("ch1.>").unwrap();
        let _sub = f.subscriber.subscribe(&f.cred, &pattern, SubscribeOptions::default(), collect(tx)).await.unwrap();

        f.broker.set_reachable(false);
        let mut overloaded = 0;
        for i in 0..15u8 {
            match f.publisher.publish(&f.cred, "ch1", "seq", Bytes::from(vec![i]), "http").await {
                Ok(()) => {}
                Err(FabricError::Overloaded) => overloaded += 1,
                Err(e) => panic!("unexpected {e}"),
            }
        }
        assert_eq!(overloaded, 5);
        assert_eq!(f.supervisor.queue().len(), 10);

        f.broker.set_reachable(true);
        for i in 0..10u8 {
            assert_eq!(recv(&mut rx).await.payload, Bytes::from(vec![i]));
        }
        f.publisher.publish(&f.cred, "ch1", "seq", Bytes::from(vec![100]), "http").await.unwrap();
        assert_eq!(recv(&mut rx).await.payload, Bytes::from(vec![100]));
        assert!(f.supervisor.queue().is_empty());
        assert_eq!(f.supervisor.state(), ConnState::Connected);
    }

    #[tokio::test]
    async fn degraded_past_deadline() {
        let mut cfg = fast();
        cfg.reconnect_deadline = Duration::from_millis(30);
        let f = fixture(cfg);
        let mut state = f.supervisor.watch();
        f.broker.set_reachable(false);
        f.supervisor.wake();
        tokio::time::timeout(Duration::from_secs(2), state.wait_for(|s| *s == ConnState::Degraded))
            .await
            .unwrap()
            .unwrap();

        let res = f.publisher.publish(&f.cred, "ch1", "a", Bytes::new(), "http").await;
        assert!(matches!(res, Err(FabricError::Unavailable(_))));

        f.broker.set_reachable(true);
        tokio::time::timeout(Duration::from_secs(2), state.wait_for(|s| *s == ConnState::Connected))
            .await
            .unwrap()
            .unwrap();
        assert!(f.publisher.publish(&f.cred, "ch1", "a", Bytes::new(), "http").await.is_ok());
    }

    #[tokio::test]
    async fn queue_group_partitions() {
        let f = fixture(fast());
        let pattern = Pattern::from_str("ch1.>").unwrap();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let opts = SubscribeOptions::default().queue_group("q");
        let s1 = f.subscriber.subscribe(&f.cred, &pattern, opts.clone(), collect(tx1)).await.unwrap();
        let s2 = f.subscriber.subscribe(&f.cred, &pattern, opts, collect(tx2)).await.unwrap();

        for sub in ["a", "b", "c", "d"] {
            f.publisher.publish(&f.cred, "ch1", sub, Bytes::new(), "http").await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut got = Vec::new();
        while let Ok(m) = rx1.try_recv() {
            got.push(m.subtopic);
        }
        while let Ok(m) = rx2.try_recv() {
            got.push(m.subtopic);
        }
        got.sort();
        assert_eq!(got, vec!["a", "b", "c", "d"]);
        assert_eq!(s1.stats().delivered + s2.stats().delivered, 4);
    }

    #[tokio::test]
    async fn unsubscribe_waits_for_handler() {
        let f = fixture(fast());
        let (started_tx, mut started) = mpsc::unbounded_channel();
        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let done2 = done.clone();
        let handler = handler_fn(move |_m| {
            let started_tx = started_tx.clone();
            let done = done2.clone();
            async move {
                let _ = started_tx.send(());
                tokio::time::sleep(Duration::from_millis(100)).await;
                done.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            }
        });
        let pattern = Pattern::from_str("ch1").unwrap();
        let sub = f.subscriber.subscribe(&f.cred, &pattern, SubscribeOptions::default(), handler).await.unwrap();
        f.publisher.publish(&f.cred, "ch1", "", Bytes::new(), "http").await.unwrap();
        started.recv().await.unwrap();

        assert_eq!(sub.stats().in_flight, 1);
        sub.unsubscribe().await.unwrap();
        assert!(done.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn drain_timeout_still_closes() {
        let f = fixture(fast());
        let (started_tx, mut started) = mpsc::unbounded_channel();
        let handler = handler_fn(move |_m| {
            let started_tx = started_tx.clone();
            async move {
                let _ = started_tx.send(());
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            }
        });
        let pattern = Pattern::from_str("ch1").unwrap();
        let sub = f.subscriber.subscribe(&f.cred, &pattern, SubscribeOptions::default(), handler).await.unwrap();
        f.publisher.publish(&f.cred, "ch1", "", Bytes::new(), "http").await.unwrap();
        started.recv().await.unwrap();

        let res = sub.unsubscribe_within(Duration::from_millis(20)).await;
        assert_eq!(res, Err(FabricError::DrainTimeout));
        assert_eq!(f.broker.subscriptions_len(), 0);
    }

    #[tokio::test]
    async fn concurrent_handlers_and_errors() {
        let f = fixture(fast());
        let running = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let peak = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let (r, p) = (running.clone(), peak.clone());
        let handler = handler_fn(move |m| {
            let (running, peak) = (r.clone(), p.clone());
            async move {
                use std::sync::atomic::Ordering::SeqCst;
                let now = running.fetch_add(1, SeqCst) + 1;
                peak.fetch_max(now, SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                running.fetch_sub(1, SeqCst);
                if m.subtopic == "bad" {
                    return Err(FabricError::Internal("handler failed".into()));
                }
                Ok(())
            }
        });
        let pattern = Pattern::from_str("ch1.*").unwrap();
        let opts = SubscribeOptions::default().concurrency(3);
        let sub = f.subscriber.subscribe(&f.cred, &pattern, opts, handler).await.unwrap();
        for s in ["a", "b", "bad"] {
            f.publisher.publish(&f.cred, "ch1", s, Bytes::new(), "http").await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(peak.load(std::sync::atomic::Ordering::SeqCst), 3);
        let stats = sub.stats();
        assert_eq!(stats.handler_errors, 1);
        assert_eq!(stats.in_flight, 0);
        sub.unsubscribe().await.unwrap();
    }

    #[tokio::test]
    async fn handler_errors_do_not_stop_delivery() {
        let f = fixture(fast());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = handler_fn(move |m: Message| {
            let tx = tx.clone();
            async move {
                let fail = m.subtopic == "bad";
                let _ = tx.send(m);
                if fail {
                    Err(FabricError::Internal("handler failed".into()))
                } else {
                    Ok(())
                }
            }
        });
        let pattern = Pattern::from_str("ch1.*").unwrap();
        let sub = f.subscriber.subscribe(&f.cred, &pattern, SubscribeOptions::default(), handler).await.unwrap();
        f.publisher.publish(&f.cred, "ch1", "bad", Bytes::new(), "http").await.unwrap();
        f.publisher.publish(&f.cred, "ch1", "good", Bytes::new(), "http").await.unwrap();
        assert_eq!(recv(&mut rx).await.subtopic, "bad");
        assert_eq!(recv(&mut rx).await.subtopic, "good");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sub.stats().handler_errors, 1);
    }

    #[tokio::test]
    async fn slow_consumer_drops_are_counted() {
        let f = fixture(fast());
        let (gate_tx, gate_rx) = tokio::sync::oneshot::channel::<()>();
        let gate_rx = Arc::new(tokio::sync::Mutex::new(Some(gate_rx)));
        let handler = handler_fn(move |_m| {
            let gate_rx = gate_rx.clone();
            async move {
                if let Some(rx) = gate_rx.lock().await.take() {
                    let _ = rx.await;
                }
                Ok(())
            }
        });
        let pattern = Pattern::from_str("ch1").unwrap();
        let opts = SubscribeOptions { capacity: Some(2), ..Default::default() };
        let sub = f.subscriber.subscribe(&f.cred, &pattern, opts, handler).await.unwrap();
        for _ in 0..10 {
            f.publisher.publish(&f.cred, "ch1", "", Bytes::new(), "http").await.unwrap();
        }
        let stats = sub.stats();
        assert!(stats.dropped >= 1);
        let _ = gate_tx.send(());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sub.stats().delivered + sub.stats().dropped, 10);
    }
}
