//! Integration tests for the control loop.
//!
//! These tests drive the decision engine tick by tick against the mock
//! hypervisor and a scripted dispatcher, covering the full flow:
//! 1. Sustained load moves the hysteresis streaks
//! 2. The engine scales the pool through the notification state machine
//! 3. Unacknowledged transitions are repaired before new decisions
//!
//! All timing runs under a paused clock, so the one-second measurement
//! windows elapse instantly.

use std::sync::Arc;

use vmherd_controller::engine::{bootstrap, Engine, EngineConfig, TickOutcome};
use vmherd_controller::hypervisor::{DomainId, Hypervisor, MockHypervisor};
use vmherd_controller::notify::ScriptedNotifier;
use vmherd_controller::registry::{NotifyState, WorkerRegistry, WorkerStat};
use vmherd_proto::Command;

fn domain(n: u32) -> DomainId {
    DomainId::new(format!("worker-{n}"))
}

fn addr(n: u32) -> String {
    format!("127.0.0.1:{}", 9100 + n)
}

fn mock_pool(count: u32) -> Arc<MockHypervisor> {
    Arc::new(MockHypervisor::new(
        (0..count).map(|n| (format!("worker-{n}"), addr(n))),
    ))
}

fn engine(
    hypervisor: &Arc<MockHypervisor>,
    notifier: &Arc<ScriptedNotifier>,
    registry: &Arc<WorkerRegistry>,
) -> Engine {
    Engine::new(
        Arc::clone(hypervisor) as Arc<dyn Hypervisor>,
        Arc::clone(notifier) as Arc<dyn vmherd_controller::notify::Notifier>,
        Arc::clone(registry),
        EngineConfig::default(),
    )
}

/// Insert an acknowledged worker with a settled sample window.
async fn acked_worker(
    registry: &WorkerRegistry,
    hypervisor: &MockHypervisor,
    n: u32,
    load: f64,
) -> DomainId {
    let id = domain(n);
    hypervisor.force_active(&id).await;
    hypervisor.set_load(&id, load).await;

    registry.insert(WorkerStat::new(id.clone())).await;
    registry.set_address(&id, addr(n)).await;
    registry.set_state(&id, NotifyState::CreateAcked).await;
    for _ in 0..3 {
        registry.apply_sample(&id, 0, load).await;
    }
    id
}

#[tokio::test(start_paused = true)]
async fn sustained_high_load_scales_out_on_the_fourth_tick() {
    let hypervisor = mock_pool(3);
    let notifier = Arc::new(ScriptedNotifier::new());
    let registry = Arc::new(WorkerRegistry::new());

    acked_worker(&registry, &hypervisor, 0, 0.9).await;
    acked_worker(&registry, &hypervisor, 1, 0.9).await;

    let mut engine = engine(&hypervisor, &notifier, &registry);

    // Patience is 3: three HIGH ticks build the streak without acting.
    for tick in 1..=3 {
        let outcome = engine.tick().await.unwrap();
        assert_eq!(outcome, TickOutcome::Idle, "tick {tick} must not act");
        assert!(notifier.sent().await.is_empty(), "no command before tick 4");
    }

    assert_eq!(engine.tick().await.unwrap(), TickOutcome::ScaledOut);
    assert_eq!(notifier.sent().await, vec![Command::ScaleOut(addr(2))]);
    assert_eq!(
        registry.get(&domain(2)).await.unwrap().state,
        NotifyState::CreateAcked
    );
}

#[tokio::test(start_paused = true)]
async fn unacknowledged_scale_out_is_repaired_not_duplicated() {
    let hypervisor = mock_pool(3);
    let notifier = Arc::new(ScriptedNotifier::new());
    let registry = Arc::new(WorkerRegistry::new());

    acked_worker(&registry, &hypervisor, 0, 0.9).await;
    acked_worker(&registry, &hypervisor, 1, 0.9).await;

    // The dispatcher rejects the first registration attempt.
    notifier.push_failed().await;

    let mut engine = engine(&hypervisor, &notifier, &registry);
    for _ in 1..=3 {
        engine.tick().await.unwrap();
    }
    assert_eq!(engine.tick().await.unwrap(), TickOutcome::ScaledOut);
    assert_eq!(
        registry.get(&domain(2)).await.unwrap().state,
        NotifyState::CreatePending
    );

    // Load is still HIGH, but the pending worker takes precedence over a
    // second scale-out. The retry carries the same address.
    assert_eq!(engine.tick().await.unwrap(), TickOutcome::Repaired);
    assert_eq!(
        notifier.sent().await,
        vec![Command::ScaleOut(addr(2)), Command::ScaleOut(addr(2))]
    );
    assert_eq!(
        registry.get(&domain(2)).await.unwrap().state,
        NotifyState::CreateAcked
    );
}

#[tokio::test(start_paused = true)]
async fn settling_discards_measurements_after_scale_out() {
    let hypervisor = mock_pool(3);
    let notifier = Arc::new(ScriptedNotifier::new());
    let registry = Arc::new(WorkerRegistry::new());

    acked_worker(&registry, &hypervisor, 0, 0.9).await;
    acked_worker(&registry, &hypervisor, 1, 0.9).await;

    let mut engine = engine(&hypervisor, &notifier, &registry);
    for _ in 1..=3 {
        engine.tick().await.unwrap();
    }
    assert_eq!(engine.tick().await.unwrap(), TickOutcome::ScaledOut);

    // Three settle rounds give the new worker time to absorb load before
    // its samples count toward a fresh decision.
    for _ in 0..3 {
        assert_eq!(engine.tick().await.unwrap(), TickOutcome::Settling);
    }
    assert_ne!(engine.tick().await.unwrap(), TickOutcome::Settling);
}

#[tokio::test(start_paused = true)]
async fn sustained_low_load_scales_in_but_never_below_one() {
    let hypervisor = mock_pool(3);
    let notifier = Arc::new(ScriptedNotifier::new());
    let registry = Arc::new(WorkerRegistry::new());

    acked_worker(&registry, &hypervisor, 0, 0.0).await;
    acked_worker(&registry, &hypervisor, 1, 0.0).await;

    let mut engine = engine(&hypervisor, &notifier, &registry);
    for _ in 1..=3 {
        assert_eq!(engine.tick().await.unwrap(), TickOutcome::Idle);
    }
    assert_eq!(engine.tick().await.unwrap(), TickOutcome::ScaledIn);
    assert_eq!(notifier.sent().await, vec![Command::ScaleIn(addr(0))]);
    assert_eq!(registry.len().await, 1);

    // The survivor is the floor: four more LOW ticks hold at one worker.
    for _ in 1..=3 {
        assert_eq!(engine.tick().await.unwrap(), TickOutcome::Idle);
    }
    assert_eq!(engine.tick().await.unwrap(), TickOutcome::AtFloor);
    assert_eq!(registry.len().await, 1);
}

#[tokio::test(start_paused = true)]
async fn bootstrap_starts_a_worker_when_none_is_active() {
    let hypervisor = mock_pool(3);
    let registry = WorkerRegistry::new();

    bootstrap(hypervisor.as_ref(), &registry).await.unwrap();

    assert_eq!(registry.len().await, 1);
    let stat = registry.get(&domain(0)).await.unwrap();
    assert_eq!(stat.state, NotifyState::CreatePending);
    assert!(hypervisor.is_active(&domain(0)).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn bootstrapped_worker_registers_on_the_first_tick() {
    let hypervisor = mock_pool(3);
    let notifier = Arc::new(ScriptedNotifier::new());
    let registry = Arc::new(WorkerRegistry::new());

    bootstrap(hypervisor.as_ref(), &registry).await.unwrap();

    let mut engine = engine(&hypervisor, &notifier, &registry);
    assert_eq!(engine.tick().await.unwrap(), TickOutcome::Repaired);
    assert_eq!(notifier.sent().await, vec![Command::ScaleOut(addr(0))]);
    assert_eq!(
        registry.get(&domain(0)).await.unwrap().state,
        NotifyState::CreateAcked
    );
}
