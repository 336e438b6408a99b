use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use pgmeili_bus::{BusConfig, BusResult, ChangeConsumer, ChangeDistributor, JetStreamBus};
use pgmeili_config::{OutputPlugin, PgMeiliConfig, SlotPolicySetting};
use pgmeili_core::{ChangeSink, SyncTarget, WalRouter};
use pgmeili_pg::{
    check_replica_identity, connect_postgres, DecodePlugin, PgResult, ReplicationConfig,
    ReplicationSession, SlotPolicy, SnapshotScanner, WireConnection,
};
use pgmeili_search::{ensure_index, MeiliClient, MeiliConfig, SearchIndex, SyncHandler};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::initial_load::run_initial_load;

type Router = WalRouter<SyncHandler<MeiliClient>>;

pub async fn cmd_run(config: PgMeiliConfig, force_initial_load: bool) -> Result<()> {
    info!("Starting pgmeili");

    let targets = config.sync_targets();
    let client = MeiliClient::new(meili_config(&config)).context("Invalid Meilisearch settings")?;
    let router = Arc::new(build_router(&targets, &client)?);
    info!(tables = router.len(), "Registered sync handlers");

    for target in &targets {
        let outcome = ensure_index(&client, &target.index, &target.primary_key)
            .await
            .with_context(|| format!("Failed to prepare index {}", target.index))?;
        debug!(index = %target.index, outcome = ?outcome, "Index ready");
    }

    let connection_string = &config.postgres.connection_string;
    let control = connect_postgres(connection_string)
        .await
        .context("Failed to connect to Postgres")?;
    check_replica_identity(&control, &config.tables())
        .await
        .context("Failed to check replica identity")?;

    let mut session = ReplicationSession::connect(connection_string, replication_config(&config))
        .await
        .context("Failed to open replication connection")?;
    session
        .identify()
        .await
        .context("Failed to identify system")?;
    let anchor = session
        .setup_slot()
        .await
        .context("Failed to set up replication slot")?;

    if force_initial_load || targets.iter().any(|target| target.initial_load) {
        if anchor.created {
            let mut scanner = SnapshotScanner::begin(control, &anchor)
                .await
                .context("Failed to open snapshot for the initial load")?;
            run_initial_load(&mut scanner, &client, &targets, force_initial_load).await?;
            scanner
                .finish()
                .await
                .context("Failed to close snapshot transaction")?;
        } else {
            warn!(
                slot = %anchor.slot_name,
                "Slot was resumed without a snapshot, skipping initial load"
            );
        }
    }

    session
        .start_streaming(anchor)
        .await
        .context("Failed to start streaming")?;

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let (session_task, consumer_task) = if config.bus.enabled {
        let bus = JetStreamBus::connect(bus_config(&config))
            .await
            .context("Failed to connect to the bus")?;
        let sink = ChangeDistributor::new(bus.publisher());
        let session_task = spawn_session(session, sink, cancel.clone());
        let consumer_task = spawn_consumer(bus, router, cancel.clone());
        (session_task, Some(consumer_task))
    } else {
        (spawn_session(session, router, cancel.clone()), None)
    };

    info!("pgmeili is running. Press Ctrl+C to stop.");
    supervise(session_task, consumer_task, cancel, config.shutdown_grace()).await?;

    info!("pgmeili shutdown complete");
    Ok(())
}

/// One sync handler per target, all sharing the index client.
fn build_router<C: SearchIndex + Clone>(
    targets: &[SyncTarget],
    client: &C,
) -> Result<WalRouter<SyncHandler<C>>> {
    let mut router = WalRouter::new();
    for target in targets {
        router
            .register(&target.table, SyncHandler::new(target.clone(), client.clone()))
            .with_context(|| format!("Failed to register {}", target.table))?;
    }
    Ok(router)
}

fn meili_config(config: &PgMeiliConfig) -> MeiliConfig {
    let section = &config.meilisearch;
    let meili = MeiliConfig::new(section.url.clone()).with_timeout(section.timeout());
    match &section.api_key {
        Some(key) => meili.with_api_key(key.clone()),
        None => meili,
    }
}

fn replication_config(config: &PgMeiliConfig) -> ReplicationConfig {
    let section = &config.replication;
    ReplicationConfig {
        slot: section.slot.clone(),
        publication: section.publication.clone(),
        tables: config.tables(),
        plugin: match section.plugin {
            OutputPlugin::Wal2json => DecodePlugin::Wal2Json,
            OutputPlugin::Pgoutput => DecodePlugin::PgOutput,
        },
        slot_policy: match section.slot_policy {
            SlotPolicySetting::Recreate => SlotPolicy::Recreate,
            SlotPolicySetting::Resume => SlotPolicy::Resume,
        },
        status_interval: section.status_interval(),
        proto_version: section.proto_version,
    }
}

fn bus_config(config: &PgMeiliConfig) -> BusConfig {
    let section = &config.bus;
    BusConfig {
        url: section.url.clone(),
        stream: section.stream.clone(),
        subject: section.subject.clone(),
        durable: section.durable.clone(),
        queue_capacity: section.queue_capacity,
    }
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, shutting down");
                cancel.cancel();
            }
            Err(e) => warn!(error = %e, "Failed to listen for Ctrl+C"),
        }
    });
}

fn spawn_session<S>(
    mut session: ReplicationSession<WireConnection>,
    sink: S,
    cancel: CancellationToken,
) -> JoinHandle<PgResult<()>>
where
    S: ChangeSink + Send + Sync + 'static,
{
    tokio::spawn(async move { session.run(&sink, &cancel).await })
}

fn spawn_consumer(
    bus: JetStreamBus,
    router: Arc<Router>,
    cancel: CancellationToken,
) -> JoinHandle<BusResult<()>> {
    let consumer = ChangeConsumer::new(router).with_queue_capacity(bus.config().queue_capacity);
    tokio::spawn(async move {
        let deliveries = bus.deliveries().await?;
        consumer.run(deliveries, cancel).await
    })
}

/// Wait until Ctrl-C or until either task ends, then stop everything.
///
/// Whatever is still running after `cancel` fires gets `grace` to finish
/// and is abandoned after that. A task that failed makes the whole run fail
/// so the process exits non-zero and the supervisor restarts it.
async fn supervise<E1, E2>(
    mut session: JoinHandle<Result<(), E1>>,
    mut consumer: Option<JoinHandle<Result<(), E2>>>,
    cancel: CancellationToken,
    grace: Duration,
) -> Result<()>
where
    E1: std::error::Error + Send + Sync + 'static,
    E2: std::error::Error + Send + Sync + 'static,
{
    let mut session_result = None;
    let mut consumer_result = None;

    tokio::select! {
        joined = &mut session => session_result = Some(joined),
        joined = join_optional(&mut consumer) => consumer_result = Some(joined),
        _ = cancel.cancelled() => {}
    }
    cancel.cancel();

    let deadline = Instant::now() + grace;
    if session_result.is_none() {
        session_result = finish_within(deadline, &mut session, "replication session").await;
    }
    if consumer_result.is_none() {
        if let Some(handle) = consumer.as_mut() {
            consumer_result = finish_within(deadline, handle, "bus consumer").await;
        }
    }

    let session_failure = session_result.and_then(|joined| failure("Replication session", joined));
    let consumer_failure = consumer_result.and_then(|joined| failure("Bus consumer", joined));
    match session_failure.or(consumer_failure) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

async fn join_optional<T>(handle: &mut Option<JoinHandle<T>>) -> Result<T, JoinError> {
    match handle {
        Some(handle) => handle.await,
        None => pending().await,
    }
}

async fn finish_within<T>(
    deadline: Instant,
    handle: &mut JoinHandle<T>,
    task: &str,
) -> Option<Result<T, JoinError>> {
    match timeout_at(deadline, &mut *handle).await {
        Ok(joined) => Some(joined),
        Err(_) => {
            warn!(task, "Task did not stop within the shutdown grace period, abandoning it");
            handle.abort();
            None
        }
    }
}

fn failure<E>(task: &str, joined: Result<Result<(), E>, JoinError>) -> Option<anyhow::Error>
where
    E: std::error::Error + Send + Sync + 'static,
{
    match joined {
        Ok(Ok(())) => {
            info!(task, "Stopped");
            None
        }
        Ok(Err(e)) => {
            error!(task, error = %e, "Stopped with an error");
            Some(anyhow::Error::new(e).context(format!("{} failed", task)))
        }
        Err(e) => Some(anyhow!("{} task did not complete: {}", task, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgmeili_bus::BusError;
    use pgmeili_core::ChangeBatch;
    use pgmeili_pg::PgError;
    use pgmeili_search::{IndexCall, MockIndex};

    fn config(extra: &str) -> PgMeiliConfig {
        PgMeiliConfig::parse(&format!(
            r#"
shutdown_grace_secs = 3

[postgres]
connection_string = "postgres://localhost/app"

[replication]
slot = "search"
publication = "search_pub"
plugin = "pgoutput"
slot_policy = "resume"
proto_version = 2

[meilisearch]
url = "http://localhost:7700"
api_key = "secret"

[[sync]]
table = "main.tenants"
index = "tenant"
pk = "id"

{}
"#,
            extra
        ))
        .unwrap()
    }

    #[test]
    fn test_replication_config_mapping() {
        let replication = replication_config(&config(""));
        assert_eq!(replication.slot, "search");
        assert_eq!(replication.publication, "search_pub");
        assert_eq!(replication.plugin, DecodePlugin::PgOutput);
        assert_eq!(replication.slot_policy, SlotPolicy::Resume);
        assert_eq!(replication.proto_version, 2);
        assert_eq!(replication.tables, vec!["main.tenants".to_string()]);
    }

    #[test]
    fn test_bus_config_mapping() {
        let bus = bus_config(&config("[bus]\nenabled = true\nsubject = \"cdc.changes\"\n"));
        assert_eq!(bus.subject, "cdc.changes");
        assert_eq!(bus.stream, BusConfig::default().stream);
    }

    #[test]
    fn test_meili_client_from_config() {
        let client = MeiliClient::new(meili_config(&config(""))).unwrap();
        assert_eq!(client.base_url().as_str(), "http://localhost:7700/");
    }

    #[tokio::test]
    async fn test_router_routes_to_configured_index() {
        let index = MockIndex::new();
        let router = build_router(&config("").sync_targets(), &index).unwrap();
        assert_eq!(router.tables().collect::<Vec<_>>(), vec!["main.tenants"]);

        let batch = ChangeBatch::parse(
            br#"{"change":[{"kind":"insert","schema":"main","table":"tenants","columnnames":["id","name"],"columnvalues":[5,"Acme"]}]}"#,
        )
        .unwrap();
        for change in batch.into_changes(0).unwrap() {
            router.deliver(change).await;
        }

        assert!(matches!(
            index.calls().as_slice(),
            [IndexCall::Add { index, docs }] if index == "tenant" && docs.len() == 1
        ));
        let handler = router.handler_for("main.tenants").unwrap();
        assert_eq!(handler.target().index, "tenant");
    }

    #[test]
    fn test_duplicate_table_fails_registration() {
        let targets = vec![
            SyncTarget::new("users", "users", "id"),
            SyncTarget::new("public.users", "people", "id"),
        ];
        assert!(build_router(&targets, &MockIndex::new()).is_err());
    }

    #[tokio::test]
    async fn test_session_failure_stops_consumer() {
        let cancel = CancellationToken::new();
        let session = tokio::spawn(async { Err::<(), _>(PgError::StreamEnded) });
        let consumer_cancel = cancel.clone();
        let consumer = tokio::spawn(async move {
            consumer_cancel.cancelled().await;
            Ok::<(), BusError>(())
        });

        let err = supervise(session, Some(consumer), cancel.clone(), Duration::from_secs(1))
            .await
            .unwrap_err();

        assert!(cancel.is_cancelled());
        assert!(err.to_string().contains("Replication session failed"));
    }

    #[tokio::test]
    async fn test_consumer_failure_stops_session() {
        let cancel = CancellationToken::new();
        let session_cancel = cancel.clone();
        let session = tokio::spawn(async move {
            session_cancel.cancelled().await;
            Ok::<(), PgError>(())
        });
        let consumer = tokio::spawn(async { Err::<(), _>(BusError::Subscribe("gone".into())) });

        let err = supervise(session, Some(consumer), cancel, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Bus consumer failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_abandons_stuck_task_after_grace() {
        let cancel = CancellationToken::new();
        let session = tokio::spawn(pending::<Result<(), PgError>>());

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        supervise::<PgError, BusError>(session, None, cancel, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_clean_shutdown() {
        let cancel = CancellationToken::new();
        let session_cancel = cancel.clone();
        let session = tokio::spawn(async move {
            session_cancel.cancelled().await;
            Ok::<(), PgError>(())
        });
        cancel.cancel();

        supervise::<PgError, BusError>(session, None, cancel, Duration::from_secs(1))
            .await
            .unwrap();
    }
}
