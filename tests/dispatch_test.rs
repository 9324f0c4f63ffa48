//! End-to-end dispatch behaviour against the in-memory broker

mod common;

use common::{group_of, push_orders, wait_until, within, Order, Orders};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use topic_dispatch::{
    BindingStatus, CommitStrategy, ConsumerRegistry, DispatchConfig, DispatchError, DispatchHost,
    Envelope, HandlerBinding, HandlerContext, MemoryBroker, RetryPolicy,
};

const WAIT: Duration = Duration::from_secs(3);

fn config() -> DispatchConfig {
    DispatchConfig::builder()
        .batch_size(100)
        .batch_timeout(Duration::from_millis(50))
        .restart_policy(RetryPolicy::fixed(3, Duration::from_millis(10)))
        .shutdown_timeout(Duration::from_secs(2))
        .build()
}

async fn record_order(
    me: Arc<Orders>,
    order: Envelope<Order>,
    _ctx: HandlerContext,
) -> anyhow::Result<()> {
    me.seen.lock().push(order.message.id);
    Ok(())
}

async fn record_batch(
    me: Arc<Orders>,
    orders: Vec<Envelope<Order>>,
    _ctx: HandlerContext,
) -> anyhow::Result<()> {
    me.batches.lock().push(orders.len());
    me.seen
        .lock()
        .extend(orders.into_iter().map(|o| o.message.id));
    Ok(())
}

#[tokio::test]
async fn test_batch_closes_at_size() {
    let broker = MemoryBroker::new();
    let orders = Arc::new(Orders::default());
    let mut registry = ConsumerRegistry::new();
    registry.consumer(orders.clone()).on_batch(
        HandlerBinding::new("on_orders")
            .topics(["orders"])
            .batch_size(3)
            .batch_timeout(Duration::from_secs(30)),
        record_batch,
    );

    let host = DispatchHost::startup(config(), Arc::new(broker.clone()), &registry)
        .await
        .unwrap();
    push_orders(&broker, "orders", 1..=6);

    assert!(wait_until(WAIT, || orders.seen().len() == 6).await);
    assert_eq!(orders.batches(), vec![3, 3]);
    assert_eq!(orders.seen(), vec![1, 2, 3, 4, 5, 6]);
    let group = group_of("Orders::on_orders");
    assert!(wait_until(WAIT, || broker.committed_offset(&group, "orders") == 6).await);

    within(host.shutdown()).await;
}

#[tokio::test]
async fn test_partial_batch_closes_at_timeout() {
    let broker = MemoryBroker::new();
    let orders = Arc::new(Orders::default());
    let mut registry = ConsumerRegistry::new();
    registry.consumer(orders.clone()).on_batch(
        HandlerBinding::new("on_orders")
            .topics(["orders"])
            .batch_size(100)
            .batch_timeout(Duration::from_millis(100)),
        record_batch,
    );

    let host = DispatchHost::startup(config(), Arc::new(broker.clone()), &registry)
        .await
        .unwrap();
    push_orders(&broker, "orders", [1, 2]);

    assert!(wait_until(WAIT, || !orders.batches().is_empty()).await);
    assert_eq!(orders.batches(), vec![2]);

    within(host.shutdown()).await;
}

#[tokio::test]
async fn test_failed_batch_is_redelivered_after_restart() {
    let broker = MemoryBroker::new();
    let orders = Arc::new(Orders::default());
    let failed_once = Arc::new(AtomicBool::new(false));

    let mut registry = ConsumerRegistry::new();
    let flag = failed_once.clone();
    registry.consumer(orders.clone()).on(
        HandlerBinding::new("on_order").topics(["orders"]).batch_size(3),
        move |me: Arc<Orders>, order: Envelope<Order>, _ctx: HandlerContext| {
            let flag = flag.clone();
            async move {
                me.seen.lock().push(order.message.id);
                if order.message.id == 2 && !flag.swap(true, Ordering::SeqCst) {
                    anyhow::bail!("order 2 rejected once");
                }
                anyhow::Ok(())
            }
        },
    );

    let host = DispatchHost::startup(config(), Arc::new(broker.clone()), &registry)
        .await
        .unwrap();
    push_orders(&broker, "orders", [1, 2, 3]);

    let group = group_of("Orders::on_order");
    assert!(wait_until(WAIT, || broker.committed_offset(&group, "orders") == 3).await);
    assert_eq!(orders.seen(), vec![1, 2, 1, 2, 3]);
    assert_eq!(host.supervisor().metrics().snapshot().restarts, 1);
    assert!(orders
        .events()
        .iter()
        .any(|e| e.starts_with("error Orders::on_order") && e.contains("rejected once")));

    within(host.shutdown()).await;
}

#[tokio::test]
async fn test_batch_received_strategy_commits_despite_failure() {
    let broker = MemoryBroker::new();
    let orders = Arc::new(Orders::default());

    let mut registry = ConsumerRegistry::new();
    registry.consumer(orders.clone()).on(
        HandlerBinding::new("on_order")
            .topics(["orders"])
            .batch_size(3)
            .commit_strategy(CommitStrategy::AfterBatchReceived),
        |me: Arc<Orders>, order: Envelope<Order>, _ctx: HandlerContext| async move {
            me.seen.lock().push(order.message.id);
            if order.message.id == 2 {
                anyhow::bail!("order 2 rejected");
            }
            anyhow::Ok(())
        },
    );

    let host = DispatchHost::startup(config(), Arc::new(broker.clone()), &registry)
        .await
        .unwrap();
    push_orders(&broker, "orders", [1, 2, 3]);

    assert!(wait_until(WAIT, || orders.seen().len() == 3).await);
    assert_eq!(orders.seen(), vec![1, 2, 3]);
    assert_eq!(broker.committed_offset(&group_of("Orders::on_order"), "orders"), 3);
    assert_eq!(host.supervisor().metrics().snapshot().restarts, 0);
    assert_eq!(
        host.supervisor().binding_status("Orders::on_order"),
        Some(BindingStatus::Running)
    );

    within(host.shutdown()).await;
}

#[tokio::test]
async fn test_manual_commit_only_when_requested() {
    let broker = MemoryBroker::new();
    let orders = Arc::new(Orders::default());

    let mut registry = ConsumerRegistry::new();
    registry.consumer(orders.clone()).on_batch(
        HandlerBinding::new("on_orders")
            .topics(["orders"])
            .batch_size(2)
            .commit_strategy(CommitStrategy::Manual),
        |me: Arc<Orders>, batch: Vec<Envelope<Order>>, ctx: HandlerContext| async move {
            let ids: Vec<u32> = batch.iter().map(|o| o.message.id).collect();
            if ids.contains(&4) {
                ctx.commit();
            }
            me.seen.lock().extend(ids);
            anyhow::Ok(())
        },
    );

    let host = DispatchHost::startup(config(), Arc::new(broker.clone()), &registry)
        .await
        .unwrap();
    let group = group_of("Orders::on_orders");

    push_orders(&broker, "orders", [1, 2]);
    assert!(wait_until(WAIT, || orders.seen().len() == 2).await);
    assert_eq!(broker.committed_offset(&group, "orders"), 0);

    push_orders(&broker, "orders", [3, 4]);
    assert!(wait_until(WAIT, || broker.committed_offset(&group, "orders") == 4).await);

    within(host.shutdown()).await;
}

#[tokio::test]
async fn test_undecodable_messages_are_dead_lettered() {
    let broker = MemoryBroker::new();
    let orders = Arc::new(Orders::default());

    let mut registry = ConsumerRegistry::new();
    registry.consumer(orders.clone()).on(
        HandlerBinding::new("on_order")
            .topics(["orders"])
            .batch_size(3)
            .dead_letter("orders.dlq"),
        record_order,
    );

    let host = DispatchHost::startup(config(), Arc::new(broker.clone()), &registry)
        .await
        .unwrap();
    push_orders(&broker, "orders", [1]);
    broker.push("orders", b"{not json".to_vec());
    push_orders(&broker, "orders", [3]);

    let group = group_of("Orders::on_order");
    assert!(wait_until(WAIT, || broker.committed_offset(&group, "orders") == 3).await);
    assert_eq!(orders.seen(), vec![1, 3]);

    let dead = broker.messages("orders.dlq");
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].payload.as_deref(), Some(&b"{not json"[..]));
    assert_eq!(dead[0].headers["dlq.reason"], "undecodable");
    assert_eq!(dead[0].headers["dlq.original.offset"], "1");
    assert_eq!(dead[0].headers["dlq.binding"], "Orders::on_order");

    let snapshot = host.supervisor().metrics().snapshot();
    assert_eq!(snapshot.messages_undecodable, 1);
    assert_eq!(snapshot.messages_dead_lettered, 1);

    within(host.shutdown()).await;
}

#[tokio::test]
async fn test_failed_messages_are_dead_lettered_after_retries() {
    let broker = MemoryBroker::new();
    let orders = Arc::new(Orders::default());

    let config = DispatchConfig::builder()
        .batch_timeout(Duration::from_millis(50))
        .handler_retry(RetryPolicy::fixed(1, Duration::from_millis(1)))
        .dead_letter_topic("orders.dlq")
        .build();

    let mut registry = ConsumerRegistry::new();
    registry.consumer(orders.clone()).on(
        HandlerBinding::new("on_order").topics(["orders"]).batch_size(3),
        |me: Arc<Orders>, order: Envelope<Order>, _ctx: HandlerContext| async move {
            me.seen.lock().push(order.message.id);
            if order.message.id == 2 {
                anyhow::bail!("order 2 rejected");
            }
            anyhow::Ok(())
        },
    );

    let host = DispatchHost::startup(config, Arc::new(broker.clone()), &registry)
        .await
        .unwrap();
    push_orders(&broker, "orders", [1, 2, 3]);

    let group = group_of("Orders::on_order");
    assert!(wait_until(WAIT, || broker.committed_offset(&group, "orders") == 3).await);
    assert_eq!(orders.seen(), vec![1, 2, 2, 3]);

    let dead = broker.messages("orders.dlq");
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].headers["dlq.reason"], "handler_failed");
    assert_eq!(dead[0].headers["dlq.error.attempts"], "2");
    assert!(dead[0].headers["dlq.error.message"].contains("order 2 rejected"));

    within(host.shutdown()).await;
}

#[tokio::test]
async fn test_restarts_are_bounded_and_isolated() {
    let broker = MemoryBroker::new();
    broker.fail_subscriptions("flaky", 100);
    let orders = Arc::new(Orders::default());

    let config = DispatchConfig::builder()
        .batch_timeout(Duration::from_millis(20))
        .restart_policy(RetryPolicy::fixed(2, Duration::from_millis(10)))
        .build();

    let mut registry = ConsumerRegistry::new();
    registry
        .consumer(orders.clone())
        .on(HandlerBinding::new("on_flaky").topics(["flaky"]), record_order)
        .on(HandlerBinding::new("on_steady").topics(["steady"]), record_order);

    let host = DispatchHost::startup(config, Arc::new(broker.clone()), &registry)
        .await
        .unwrap();
    let supervisor = host.supervisor();

    assert!(wait_until(WAIT, || supervisor.is_degraded()).await);
    assert_eq!(broker.subscribe_attempts("flaky"), 3);
    assert!(matches!(
        supervisor.binding_status("Orders::on_flaky"),
        Some(BindingStatus::Failed(_))
    ));
    assert_eq!(supervisor.metrics().snapshot().restarts, 2);

    push_orders(&broker, "steady", [7]);
    assert!(wait_until(WAIT, || orders.seen() == vec![7]).await);
    assert_eq!(
        supervisor.binding_status("Orders::on_steady"),
        Some(BindingStatus::Running)
    );

    within(host.shutdown()).await;
}

#[tokio::test]
async fn test_transport_error_restarts_worker() {
    let broker = MemoryBroker::new();
    let orders = Arc::new(Orders::default());

    let mut registry = ConsumerRegistry::new();
    registry
        .consumer(orders.clone())
        .on(HandlerBinding::new("on_order").topics(["orders"]), record_order);

    let host = DispatchHost::startup(config(), Arc::new(broker.clone()), &registry)
        .await
        .unwrap();
    assert!(wait_until(WAIT, || broker.live_subscriptions("orders") == 1).await);

    broker.inject_error("orders", "broker went away");
    assert!(wait_until(WAIT, || host.supervisor().metrics().snapshot().restarts == 1).await);
    assert!(wait_until(WAIT, || broker.live_subscriptions("orders") == 1).await);

    push_orders(&broker, "orders", [5]);
    assert!(wait_until(WAIT, || orders.seen() == vec![5]).await);
    assert_eq!(host.supervisor().metrics().error_count("transport"), 2);

    within(host.shutdown()).await;
}

#[tokio::test]
async fn test_restart_budget_resets_after_progress() {
    let broker = MemoryBroker::new();
    let orders = Arc::new(Orders::default());

    let config = DispatchConfig::builder()
        .batch_timeout(Duration::from_millis(20))
        .restart_policy(RetryPolicy::fixed(2, Duration::from_millis(10)))
        .build();

    let mut registry = ConsumerRegistry::new();
    registry
        .consumer(orders.clone())
        .on(HandlerBinding::new("on_order").topics(["orders"]), record_order);

    let host = DispatchHost::startup(config, Arc::new(broker.clone()), &registry)
        .await
        .unwrap();
    let supervisor = host.supervisor();
    let group = group_of("Orders::on_order");

    // More transient failures than the budget allows, each after a
    // committed batch.
    for round in 1..=3u32 {
        assert!(wait_until(WAIT, || broker.live_subscriptions("orders") == 1).await);
        push_orders(&broker, "orders", [round]);
        assert!(wait_until(WAIT, || broker.committed_offset(&group, "orders") == round as i64).await);

        broker.inject_error("orders", "connection reset");
        assert!(wait_until(WAIT, || supervisor.metrics().snapshot().restarts == round as u64).await);
    }

    assert!(wait_until(WAIT, || broker.live_subscriptions("orders") == 1).await);
    push_orders(&broker, "orders", [4]);
    assert!(wait_until(WAIT, || broker.committed_offset(&group, "orders") == 4).await);
    assert_eq!(orders.seen(), vec![1, 2, 3, 4]);
    assert!(!supervisor.is_degraded());
    assert_eq!(
        supervisor.binding_status("Orders::on_order"),
        Some(BindingStatus::Running)
    );

    within(host.shutdown()).await;
}

#[tokio::test]
async fn test_unreachable_dead_letter_topic_keeps_batch_uncommitted() {
    let broker = MemoryBroker::with_precreated_topics(["orders"]);
    let orders = Arc::new(Orders::default());

    let config = DispatchConfig::builder()
        .batch_timeout(Duration::from_millis(20))
        .restart_policy(RetryPolicy::fixed(1, Duration::from_millis(10)))
        .build();

    let mut registry = ConsumerRegistry::new();
    registry.consumer(orders.clone()).on(
        HandlerBinding::new("on_order")
            .topics(["orders"])
            .batch_size(2)
            .dead_letter("orders.dlq"),
        record_order,
    );

    let host = DispatchHost::startup(config, Arc::new(broker.clone()), &registry)
        .await
        .unwrap();
    broker.push("orders", b"{not json".to_vec());
    push_orders(&broker, "orders", [2]);

    let supervisor = host.supervisor();
    assert!(wait_until(WAIT, || supervisor.is_degraded()).await);
    assert!(matches!(
        supervisor.binding_status("Orders::on_order"),
        Some(BindingStatus::Failed(reason)) if reason.contains("dead-lettering")
    ));
    assert_eq!(broker.committed_offset(&group_of("Orders::on_order"), "orders"), 0);
    assert!(broker.messages("orders.dlq").is_empty());
    assert_eq!(orders.seen(), vec![2, 2]);
    assert_eq!(supervisor.metrics().error_count("dead_letter"), 2);

    within(host.shutdown()).await;
}

#[tokio::test]
async fn test_lifecycle_callbacks_follow_the_binding() {
    let broker = MemoryBroker::new();
    let orders = Arc::new(Orders::default());

    let mut registry = ConsumerRegistry::new();
    registry
        .consumer(orders.clone())
        .on(HandlerBinding::new("on_order").topics(["orders"]), record_order);

    let host = DispatchHost::startup(config(), Arc::new(broker.clone()), &registry)
        .await
        .unwrap();
    assert!(wait_until(WAIT, || orders.events().len() >= 2).await);

    broker.trigger_rebalance("orders");
    assert!(wait_until(WAIT, || orders.events().len() >= 4).await);

    within(host.shutdown()).await;

    assert_eq!(
        orders.events(),
        vec![
            "started Orders::on_order",
            "assigned 1",
            "revoked 1",
            "assigned 1",
            "stopped Orders::on_order",
        ]
    );
}

#[tokio::test]
async fn test_stop_flushes_open_batch() {
    let broker = MemoryBroker::new();
    let orders = Arc::new(Orders::default());

    let mut registry = ConsumerRegistry::new();
    registry.consumer(orders.clone()).on_batch(
        HandlerBinding::new("on_orders")
            .topics(["orders"])
            .batch_size(100)
            .batch_timeout(Duration::from_secs(60)),
        record_batch,
    );

    let host = DispatchHost::startup(config(), Arc::new(broker.clone()), &registry)
        .await
        .unwrap();
    push_orders(&broker, "orders", [1, 2]);
    assert!(
        wait_until(WAIT, || host.supervisor().metrics().consumed_by("Orders::on_orders") == 2)
            .await
    );
    assert!(orders.batches().is_empty());

    let report = within(host.shutdown()).await;
    assert_eq!(report.graceful, 1);
    assert!(report.is_graceful());
    assert_eq!(orders.batches(), vec![2]);
    assert_eq!(broker.committed_offset(&group_of("Orders::on_orders"), "orders"), 2);
}

#[tokio::test]
async fn test_revocation_released_after_open_batch_commits() {
    let broker = MemoryBroker::new();
    let orders = Arc::new(Orders::default());

    let mut registry = ConsumerRegistry::new();
    registry.consumer(orders.clone()).on_batch(
        HandlerBinding::new("on_orders")
            .topics(["orders"])
            .batch_size(100)
            .batch_timeout(Duration::from_secs(60)),
        record_batch,
    );

    let host = DispatchHost::startup(config(), Arc::new(broker.clone()), &registry)
        .await
        .unwrap();
    let group = group_of("Orders::on_orders");
    push_orders(&broker, "orders", [1, 2]);
    assert!(
        wait_until(WAIT, || host.supervisor().metrics().consumed_by("Orders::on_orders") == 2)
            .await
    );
    assert!(broker.revocations_handled(&group).is_empty());

    broker.trigger_rebalance("orders");
    assert!(wait_until(WAIT, || !broker.revocations_handled(&group).is_empty()).await);

    assert_eq!(broker.revocations_handled(&group), vec![2]);
    assert_eq!(orders.batches(), vec![2]);

    within(host.shutdown()).await;
}

#[tokio::test]
async fn test_stop_forces_stuck_workers() {
    let broker = MemoryBroker::new();
    let orders = Arc::new(Orders::default());

    let config = DispatchConfig::builder()
        .batch_timeout(Duration::from_millis(10))
        .shutdown_timeout(Duration::from_millis(100))
        .build();

    let mut registry = ConsumerRegistry::new();
    registry.consumer(orders.clone()).on(
        HandlerBinding::new("on_order").topics(["orders"]).batch_size(1),
        |me: Arc<Orders>, order: Envelope<Order>, _ctx: HandlerContext| async move {
            me.seen.lock().push(order.message.id);
            tokio::time::sleep(Duration::from_secs(30)).await;
            anyhow::Ok(())
        },
    );

    let host = DispatchHost::startup(config, Arc::new(broker.clone()), &registry)
        .await
        .unwrap();
    push_orders(&broker, "orders", [1]);
    assert!(wait_until(WAIT, || orders.seen() == vec![1]).await);

    let report = within(host.shutdown()).await;
    assert_eq!(report.total, 1);
    assert_eq!(report.forced, 1);
    assert_eq!(report.inflight_lost, 1);
    assert_eq!(broker.committed_offset(&group_of("Orders::on_order"), "orders"), 0);
    assert!(orders
        .events()
        .contains(&"stopped Orders::on_order".to_string()));
}

#[tokio::test]
async fn test_missing_groups_fail_before_any_worker_starts() {
    let broker = MemoryBroker::new();
    let orders = Arc::new(Orders::default());

    let config = DispatchConfig::builder()
        .topic_group("Analytics", ["topic.a", "topic.b"])
        .topic_group("Empty", Vec::<String>::new())
        .build();

    let mut registry = ConsumerRegistry::new();
    registry
        .consumer(orders.clone())
        .on(HandlerBinding::new("on_ok").group("Analytics"), record_order)
        .on(HandlerBinding::new("on_billing").group("Billing"), record_order)
        .on(HandlerBinding::new("on_empty").group("Empty"), record_order);

    let err = match DispatchHost::startup(config, Arc::new(broker.clone()), &registry).await {
        Err(err) => err,
        Ok(_) => panic!("startup should fail"),
    };

    match &err {
        DispatchError::MissingGroups { missing, available } => {
            assert_eq!(missing.len(), 2);
            assert_eq!(missing[0].handler, "Orders::on_billing");
            assert!(!missing[0].empty);
            assert_eq!(missing[1].handler, "Orders::on_empty");
            assert!(missing[1].empty);
            assert_eq!(available, &vec!["Analytics".to_string(), "Empty".to_string()]);
        }
        other => panic!("unexpected error: {}", other),
    }
    let message = err.to_string();
    assert!(message.contains("Billing"));
    assert!(message.contains("Empty"));

    assert_eq!(broker.subscribe_attempts("topic.a"), 0);
    assert!(orders.events().is_empty());
}
