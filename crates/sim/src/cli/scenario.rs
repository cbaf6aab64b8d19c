use core::time::Duration;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use docket_config::SyncConfig;
use docket_primitives::entity::Entity;
use docket_primitives::filter::{Filter, SortSpec};
use docket_primitives::ids::{EntityKind, EntityRef};
use docket_primitives::mutation::{FailureKind, MutationChange};
use docket_primitives::view::{ListViewDef, ScalarViewDef, ViewKey};
use docket_sync::testing::MemoryAuthority;
use docket_sync::{SessionState, SyncClient};
use eyre::{bail, eyre, Result as EyreResult, WrapErr};
use tokio::time::{sleep, timeout};
use tracing::info;

use super::RootArgs;
use crate::render;

/// Upper bound on waiting for background work in a scenario.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Run a scripted scenario and print the views after every step
#[derive(Debug, Parser)]
pub struct ScenarioCommand {
    #[command(subcommand)]
    pub scenario: Scenario,
}

#[derive(Debug, Subcommand)]
pub enum Scenario {
    /// Close one ticket of the open list
    CloseTicket {
        /// Ticket to close, between 40 and 44
        #[arg(long, default_value_t = 42)]
        ticket: u64,

        /// Have the server reject the change
        #[arg(long)]
        reject: bool,
    },
    /// Assign several tickets in one bulk mutation
    BulkAssign {
        /// Number of tickets
        #[arg(long, default_value_t = 5)]
        count: u64,

        /// Ticket the server refuses to assign
        #[arg(long, value_name = "ID")]
        fail: Option<u64>,

        #[arg(long, default_value = "alice")]
        assignee: String,
    },
    /// Drop the push channel, change data meanwhile, and resynchronize
    Reconnect,
}

impl ScenarioCommand {
    pub async fn run(self, root_args: &RootArgs) -> EyreResult<()> {
        let config = root_args.sync_config()?;

        match self.scenario {
            Scenario::CloseTicket { ticket, reject } => close_ticket(config, ticket, reject).await,
            Scenario::BulkAssign {
                count,
                fail,
                assignee,
            } => bulk_assign(config, count, fail, &assignee).await,
            Scenario::Reconnect => reconnect(config).await,
        }
    }
}

/// A client wired to an in-memory authority, with an open-ticket list and
/// counter loaded.
struct World {
    authority: Arc<MemoryAuthority>,
    client: SyncClient,
    open: ViewKey,
    counter: ViewKey,
}

impl World {
    async fn new(config: SyncConfig, tickets: impl IntoIterator<Item = u64>) -> EyreResult<Self> {
        let authority = Arc::new(MemoryAuthority::new());
        authority.seed(tickets.into_iter().map(|id| ticket(id, i64::try_from(id).unwrap_or(0))));

        let client = SyncClient::new(
            config,
            authority.clone(),
            authority.clone(),
            authority.clone(),
        );

        let open_tickets = Filter::new(EntityKind::Ticket).eq("status", "open");
        let open = client.register_list(
            ListViewDef::new("open", open_tickets.clone())
                .sorted_by(SortSpec::descending("updated_at")),
        );
        let counter = client.register_scalar(ScalarViewDef::count("open", "all", open_tickets));

        client
            .refresh(&open)
            .await
            .wrap_err("failed to load the open list")?;
        client
            .refresh(&counter)
            .await
            .wrap_err("failed to load the open counter")?;

        Ok(Self {
            authority,
            client,
            open,
            counter,
        })
    }

    fn print(&self, label: &str) {
        render::views(label, &self.client, &self.open, &self.counter);
    }

    async fn wait_for_session(&self, wanted: SessionState) -> EyreResult<()> {
        let mut session = self.client.watch_session();
        let reached = timeout(SETTLE_TIMEOUT, session.wait_for(|state| *state == wanted))
            .await
            .map(|state| state.is_ok())
            .unwrap_or(false);

        if !reached {
            bail!("session never became {wanted}");
        }
        Ok(())
    }
}

fn ticket(id: u64, updated_at: i64) -> Entity {
    Entity::new(EntityRef::ticket(id))
        .with("status", "open")
        .with("title", format!("Ticket {id}"))
        .with("updated_at", updated_at)
}

async fn close_ticket(config: SyncConfig, id: u64, reject: bool) -> EyreResult<()> {
    let world = World::new(config, 40..=44).await?;
    let target = EntityRef::ticket(id);
    if world.authority.entity(&target).is_none() {
        bail!("ticket {id} is not part of the scenario");
    }

    if reject {
        world
            .authority
            .fail_mutations_for(target, FailureKind::Validation, "ticket is locked");
    }
    world.authority.hold_mutations();
    world.print("before");

    let mut counter = world
        .client
        .observe(&world.counter)
        .map_err(|err| eyre!("counter vanished: {err:?}"))?;

    let close = tokio::spawn({
        let client = world.client.clone();
        async move { client.set_field(target, "status", "closed").await }
    });

    let _optimistic = timeout(SETTLE_TIMEOUT, counter.changed())
        .await
        .wrap_err("optimistic update never published")??;
    world.print("optimistic");

    world.authority.release_mutations();
    let result = close.await?;
    world.print("settled");

    match result {
        Ok(_) => info!(%target, "Close committed"),
        Err(err) => info!(%target, %err, "Close rolled back"),
    }
    render::field(&world.client, target, "status");

    Ok(())
}

async fn bulk_assign(
    config: SyncConfig,
    count: u64,
    fail: Option<u64>,
    assignee: &str,
) -> EyreResult<()> {
    let world = World::new(config, 1..=count).await?;
    if let Some(id) = fail {
        world.authority.fail_mutations_for(
            EntityRef::ticket(id),
            FailureKind::Validation,
            "agent is not on the team",
        );
    }

    let targets: Vec<EntityRef> = (1..=count).map(EntityRef::ticket).collect();
    let result = world
        .client
        .mutate_bulk(targets.clone(), MutationChange::set("assignee", assignee))
        .await;

    match &result {
        Ok(committed) => info!(committed = committed.len(), "Bulk assignment committed"),
        Err(err) => info!(%err, "Bulk assignment did not fully commit"),
    }
    for target in targets {
        render::field(&world.client, target, "assignee");
    }

    Ok(())
}

async fn reconnect(config: SyncConfig) -> EyreResult<()> {
    let world = World::new(config, 40..=44).await?;
    let _list = world
        .client
        .observe(&world.open)
        .map_err(|err| eyre!("list vanished: {err:?}"))?;
    let _counter = world
        .client
        .observe(&world.counter)
        .map_err(|err| eyre!("counter vanished: {err:?}"))?;

    world.client.start("tickets");
    world.wait_for_session(SessionState::Connected).await?;
    world.print("connected");

    world.authority.disconnect_all();
    world
        .authority
        .remote_update(EntityRef::ticket(41), "status", "closed");
    let created = world.authority.remote_create(ticket(0, 99));
    info!(%created, "Changed two tickets while disconnected");
    world.print("missed");

    let resynced = timeout(SETTLE_TIMEOUT, async {
        while world.client.stats().resyncs == 0 {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    if resynced.is_err() {
        bail!("no resync after reconnecting");
    }
    world.print("resynced");

    world.client.stop().await;
    Ok(())
}
