//! Worker pool sizing and idle scale-down.

use pretty_assertions::assert_eq;
use sediment_core::job::JobState;
use sediment_core::pipeline::ParallelismSpec;
use sediment_scheduler::expected_replicas;
use sediment_tests::*;
use std::time::Duration;

#[test]
fn test_replica_computation() {
    assert_eq!(expected_replicas(None, 8), 1);
    assert_eq!(expected_replicas(Some(&ParallelismSpec::Constant(3)), 8), 3);
    assert_eq!(expected_replicas(Some(&ParallelismSpec::Constant(0)), 8), 1);
    assert_eq!(expected_replicas(Some(&ParallelismSpec::Coefficient(0.5)), 8), 4);
    assert_eq!(expected_replicas(Some(&ParallelismSpec::Coefficient(0.01)), 8), 1);
}

#[tokio::test]
async fn test_coefficient_follows_capacity() {
    let cluster = TestCluster::builder()
        .orchestrator(RecordingOrchestrator::new(6))
        .build()
        .await
        .expect("cluster");
    cluster.graph.create_repo("a").await.expect("create repo");
    commit_files(&cluster.graph, "a", "master", &[("/1", "x")])
        .await
        .expect("commit");

    let spec = PipelineFixture::with_parallelism(
        PipelineFixture::simple("p", "a", "/*"),
        ParallelismSpec::Coefficient(0.5),
    );
    cluster.scheduler.create_pipeline(spec, false).await.expect("create");
    let jobs = wait_for_jobs(&cluster.scheduler, "p", 1).await.expect("job");
    wait_for_job(&cluster.scheduler, jobs[0].id).await.expect("finished");

    assert_eq!(cluster.orchestrator.replicas("pipeline-p"), Some(3));
    assert_eq!(cluster.scheduler.target_replicas("p").await, Some(3));
}

#[tokio::test]
async fn test_idle_pool_scales_to_zero_and_back() {
    let cluster = TestCluster::new().await.expect("cluster");
    cluster.graph.create_repo("a").await.expect("create repo");
    commit_files(&cluster.graph, "a", "master", &[("/1", "x")])
        .await
        .expect("commit");

    let spec = PipelineFixture::with_scale_down(
        PipelineFixture::simple("p", "a", "/*"),
        Duration::from_millis(30),
    );
    cluster.scheduler.create_pipeline(spec, false).await.expect("create");
    let jobs = wait_for_jobs(&cluster.scheduler, "p", 1).await.expect("job");
    wait_for_job(&cluster.scheduler, jobs[0].id).await.expect("finished");

    wait_for(DEFAULT_TIMEOUT, || async {
        (cluster.orchestrator.replicas("pipeline-p") == Some(0)).then_some(())
    })
    .await
    .expect("scaled down");
    assert!(cluster.scheduler.metrics().snapshot().scale_downs >= 1);

    commit_files(&cluster.graph, "a", "master", &[("/2", "y")])
        .await
        .expect("commit");
    let jobs = wait_for_jobs(&cluster.scheduler, "p", 2).await.expect("jobs");
    let job = wait_for_job(&cluster.scheduler, jobs[0].id).await.expect("finished");
    assert_eq!(job.state, JobState::Success);

    let history = cluster.orchestrator.history();
    let pool: Vec<u64> = history
        .iter()
        .filter(|(p, _)| p == "pipeline-p")
        .map(|(_, r)| *r)
        .collect();
    assert_eq!(&pool[..3], &[1, 0, 1]);
}

#[tokio::test]
async fn test_pool_without_threshold_stays_up() {
    let cluster = TestCluster::new().await.expect("cluster");
    cluster.graph.create_repo("a").await.expect("create repo");
    commit_files(&cluster.graph, "a", "master", &[("/1", "x")])
        .await
        .expect("commit");
    cluster
        .scheduler
        .create_pipeline(PipelineFixture::simple("p", "a", "/*"), false)
        .await
        .expect("create");
    let jobs = wait_for_jobs(&cluster.scheduler, "p", 1).await.expect("job");
    wait_for_job(&cluster.scheduler, jobs[0].id).await.expect("finished");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(cluster.orchestrator.replicas("pipeline-p"), Some(1));
    assert_eq!(cluster.scheduler.metrics().snapshot().scale_downs, 0);
}

#[tokio::test]
async fn test_transient_orchestrator_errors_are_retried() {
    let cluster = TestCluster::new().await.expect("cluster");
    cluster.graph.create_repo("a").await.expect("create repo");
    commit_files(&cluster.graph, "a", "master", &[("/1", "x")])
        .await
        .expect("commit");

    cluster.orchestrator.fail_next(2);
    cluster
        .scheduler
        .create_pipeline(PipelineFixture::simple("p", "a", "/*"), false)
        .await
        .expect("create");
    let jobs = wait_for_jobs(&cluster.scheduler, "p", 1).await.expect("job");
    let job = wait_for_job(&cluster.scheduler, jobs[0].id).await.expect("finished");

    assert_eq!(job.state, JobState::Success);
    assert_eq!(cluster.orchestrator.replicas("pipeline-p"), Some(1));
}

#[tokio::test]
async fn test_unreachable_orchestrator_fails_job() {
    let cluster = TestCluster::new().await.expect("cluster");
    cluster.graph.create_repo("a").await.expect("create repo");
    commit_files(&cluster.graph, "a", "master", &[("/1", "x")])
        .await
        .expect("commit");

    cluster.orchestrator.fail_next(100);
    cluster
        .scheduler
        .create_pipeline(PipelineFixture::simple("p", "a", "/*"), false)
        .await
        .expect("create");
    let jobs = wait_for_jobs(&cluster.scheduler, "p", 1).await.expect("job");
    let job = wait_for_job(&cluster.scheduler, jobs[0].id).await.expect("finished");

    assert_eq!(job.state, JobState::Failure);
    assert!(job.reason.is_some());
    assert_eq!(cluster.runner.call_count(), 0);
}
