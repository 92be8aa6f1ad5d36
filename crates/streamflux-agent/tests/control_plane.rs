//! Control-protocol integration tests: start/stop/query commands broadcast
//! across every agent on a provider, with typed per-agent results.

use std::sync::Arc;
use std::time::Duration;
use streamflux_agent::{
    AgentOptions, AgentState, CommandOutcome, ControlCommand, RunState, StreamProviderManager,
};
use streamflux_checkpoint::MemoryCheckpointStore;
use streamflux_core::MemoryQueueAdapter;

const PARTITIONS: u32 = 8;

fn test_options() -> AgentOptions {
    AgentOptions {
        checkpoint_namespace: "control-tests".to_string(),
        checkpoint_persist_interval: Duration::from_millis(25),
        idle_pull_delay: Duration::from_millis(5),
        initial_backoff: Duration::from_millis(5),
        max_backoff: Duration::from_millis(20),
        max_pull_attempts: 3,
        ..AgentOptions::default()
    }
}

async fn make_provider() -> (Arc<MemoryQueueAdapter>, StreamProviderManager) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let ids: Vec<u32> = (0..PARTITIONS).collect();
    let adapter = Arc::new(MemoryQueueAdapter::new(&ids));
    let checkpoints = Arc::new(MemoryCheckpointStore::new());
    let manager = StreamProviderManager::new(
        "control-tests",
        "memory",
        adapter.clone(),
        checkpoints,
        test_options(),
    )
    .await;

    manager
        .on_membership_change(&["silo-a".to_string(), "silo-b".to_string()])
        .await
        .unwrap();
    (adapter, manager)
}

fn running_counts(results: &[streamflux_agent::AgentCommandResult]) -> Vec<usize> {
    results
        .iter()
        .map(|r| match r.outcome {
            CommandOutcome::RunningPartitions(n) => n,
            ref other => panic!("expected RunningPartitions, got {:?}", other),
        })
        .collect()
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn test_start_stop_restart_partition_counts() {
    let (_adapter, manager) = make_provider().await;

    // Start: two agents, counts summing to the provisioned partition count.
    manager.execute(ControlCommand::StartAgents).await.unwrap();
    settle().await;

    let counts = running_counts(
        &manager
            .execute(ControlCommand::GetNumberRunningAgents)
            .await
            .unwrap(),
    );
    assert_eq!(counts.len(), 2);
    assert_eq!(counts.iter().sum::<usize>(), PARTITIONS as usize);
    assert_eq!(manager.run_state().await, Some(RunState::AgentsStarted));

    // Stop: both counts drop to zero.
    manager.execute(ControlCommand::StopAgents).await.unwrap();

    let counts = running_counts(
        &manager
            .execute(ControlCommand::GetNumberRunningAgents)
            .await
            .unwrap(),
    );
    assert_eq!(counts, vec![0, 0]);
    assert_eq!(manager.run_state().await, Some(RunState::AgentsStopped));

    // Restart restores the full sum.
    manager.execute(ControlCommand::StartAgents).await.unwrap();
    settle().await;

    let counts = running_counts(
        &manager
            .execute(ControlCommand::GetNumberRunningAgents)
            .await
            .unwrap(),
    );
    assert_eq!(counts.iter().sum::<usize>(), PARTITIONS as usize);
    assert_eq!(manager.run_state().await, Some(RunState::AgentsStarted));
}

#[tokio::test]
async fn test_start_agents_is_idempotent() {
    let (_adapter, manager) = make_provider().await;

    manager.execute(ControlCommand::StartAgents).await.unwrap();
    settle().await;
    assert_eq!(manager.run_state().await, Some(RunState::AgentsStarted));
    assert_eq!(manager.agent_count().await, 2);

    // Second StartAgents: same aggregate state, no duplicate agents.
    let results = manager.execute(ControlCommand::StartAgents).await.unwrap();
    assert_eq!(results.len(), 2);
    settle().await;
    assert_eq!(manager.run_state().await, Some(RunState::AgentsStarted));
    assert_eq!(manager.agent_count().await, 2);

    let counts = running_counts(
        &manager
            .execute(ControlCommand::GetNumberRunningAgents)
            .await
            .unwrap(),
    );
    assert_eq!(counts.iter().sum::<usize>(), PARTITIONS as usize);

    manager.execute(ControlCommand::StopAgents).await.unwrap();
}

#[tokio::test]
async fn test_stop_agents_is_idempotent() {
    let (_adapter, manager) = make_provider().await;

    // StopAgents before any start is a no-op.
    manager.execute(ControlCommand::StopAgents).await.unwrap();
    assert_eq!(manager.run_state().await, Some(RunState::AgentsStopped));

    manager.execute(ControlCommand::StartAgents).await.unwrap();
    settle().await;

    manager.execute(ControlCommand::StopAgents).await.unwrap();
    manager.execute(ControlCommand::StopAgents).await.unwrap();
    assert_eq!(manager.run_state().await, Some(RunState::AgentsStopped));
}

#[tokio::test]
async fn test_agent_states_reported_per_agent() {
    let (_adapter, manager) = make_provider().await;

    let results = manager
        .execute(ControlCommand::GetAgentsState)
        .await
        .unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].agent_id, "silo-a");
    assert_eq!(results[1].agent_id, "silo-b");
    for result in &results {
        assert_eq!(result.outcome, CommandOutcome::State(AgentState::Stopped));
    }

    manager.execute(ControlCommand::StartAgents).await.unwrap();
    settle().await;

    let results = manager
        .execute(ControlCommand::GetAgentsState)
        .await
        .unwrap();
    for result in &results {
        assert_eq!(result.outcome, CommandOutcome::State(AgentState::Started));
    }

    manager.execute(ControlCommand::StopAgents).await.unwrap();
}

#[tokio::test]
async fn test_faulted_agent_surfaced_not_crashed() {
    let (adapter, manager) = make_provider().await;

    // Sorted partitions over sorted members: silo-a owns the even ones.
    adapter.fail_next_pulls(0, 1_000).await;

    manager.execute(ControlCommand::StartAgents).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let results = manager
        .execute(ControlCommand::GetAgentsState)
        .await
        .unwrap();
    let state_of = |agent_id: &str| {
        results
            .iter()
            .find(|r| r.agent_id == agent_id)
            .map(|r| r.outcome.clone())
            .unwrap()
    };

    assert_eq!(
        state_of("silo-a"),
        CommandOutcome::State(AgentState::Faulted)
    );
    assert_eq!(
        state_of("silo-b"),
        CommandOutcome::State(AgentState::Started)
    );

    // Not a clean aggregate while one agent is faulted.
    assert_eq!(manager.run_state().await, None);

    // A faulted agent reports zero running partitions.
    let counts = running_counts(
        &manager
            .execute(ControlCommand::GetNumberRunningAgents)
            .await
            .unwrap(),
    );
    assert_eq!(counts.iter().sum::<usize>(), (PARTITIONS / 2) as usize);

    manager.execute(ControlCommand::StopAgents).await.unwrap();
}
