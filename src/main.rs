use anyhow::Context;
use bson::{Bson, Document};
use clap::{Parser, Subcommand};
use livedata::{
    config::Config,
    connection::{Connection, SubscribeCallbacks},
    cursor::CursorDescription,
    doc_id::DocId,
    fence::WriteFence,
    fetcher::CoalescingFetcher,
    multiplex::{ChannelMultiplexer, ObserveEvent},
    oplog::{DriverOptions, OplogHandle, OplogObserveDriver},
    protocol::DataMessage,
    source::{DocumentSource, MemorySource, PgSource},
    store::{LocalCollection, Store},
    stream::{ChannelStream, run_tcp},
};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;

/// Live data client and observer.
#[derive(Parser)]
#[command(name = "livedata")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect to a DDP server and log every store update
    Tail {
        /// Server address (host:port)
        #[arg(long, env = "LIVEDATA_SERVER_ADDR")]
        server: Option<String>,

        /// Subscription as `name` or `name:<json params>`; repeatable
        #[arg(long = "sub")]
        subs: Vec<String>,

        /// Collections to mirror locally; repeatable
        #[arg(long = "collection")]
        collections: Vec<String>,
    },

    /// Run a live query and log its events. Writes are read from stdin, one
    /// JSON command per line: {"op":"insert","doc":{..}}, {"op":"update","id":..,"update":{..}},
    /// {"op":"remove","id":..} or {"op":"drop"}
    Observe {
        #[arg(long)]
        collection: String,

        /// Selector as JSON
        #[arg(long, default_value = "{}")]
        selector: String,

        /// Projection as JSON
        #[arg(long)]
        fields: Option<String>,

        /// Store documents in Postgres instead of memory
        #[arg(long, env = "LIVEDATA_POSTGRES_URL")]
        postgres_url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging with env filter, e.g.: RUST_LOG=info,livedata=debug
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .compact()
        .init();

    let cli = Cli::parse();
    let cfg = Config::load().unwrap_or_default();

    let outcome = match cli.command {
        Command::Tail { server, subs, collections } => tail(cfg, server, subs, collections).await,
        Command::Observe { collection, selector, fields, postgres_url } => {
            observe(cfg, collection, selector, fields, postgres_url).await
        }
    };
    if let Err(e) = outcome {
        tracing::error!(error = %format!("{e:?}"), "livedata terminated with error");
    }

    Ok(())
}

/// Store that logs each update before applying it to a local collection.
struct LoggingStore {
    inner: LocalCollection,
}

impl Store for LoggingStore {
    fn begin_update(&mut self) {
        self.inner.begin_update();
    }

    fn update(&mut self, msg: &DataMessage) {
        tracing::info!(
            collection = %self.inner.name(),
            id = msg.id.as_deref().unwrap_or("-"),
            set = ?msg.set,
            unset = ?msg.unset,
            "update"
        );
        self.inner.update(msg);
    }

    fn end_update(&mut self) {
        self.inner.end_update();
        tracing::debug!(collection = %self.inner.name(), docs = self.inner.len(), "batch applied");
    }

    fn reset(&mut self) {
        self.inner.reset();
    }
}

fn parse_sub(raw: &str) -> anyhow::Result<(String, Vec<Value>)> {
    let Some((name, params)) = raw.split_once(':') else {
        return Ok((raw.to_string(), Vec::new()));
    };
    let params: Value = serde_json::from_str(params).with_context(|| format!("params for subscription '{name}'"))?;
    let params = match params {
        Value::Array(items) => items,
        other => vec![other],
    };
    Ok((name.to_string(), params))
}

async fn tail(cfg: Config, server: Option<String>, subs: Vec<String>, collections: Vec<String>) -> anyhow::Result<()> {
    let addr = server.unwrap_or_else(|| cfg.server_addr.clone());
    let (stream, outgoing) = ChannelStream::new();
    let conn = Connection::new(Arc::new(stream));

    let mut mirrors = Vec::new();
    for name in &collections {
        let local = LocalCollection::new(name.as_str());
        conn.register_store(name, Box::new(LoggingStore { inner: local.clone() }));
        mirrors.push(local);
    }

    let mut wanted: Vec<(String, Vec<Value>)> = cfg.subscriptions.iter().map(|s| (s.name.clone(), s.params.clone())).collect();
    for raw in &subs {
        wanted.push(parse_sub(raw)?);
    }
    let mut handles = Vec::new();
    for (name, params) in wanted {
        let ready_name = name.clone();
        let error_name = name.clone();
        let callbacks = SubscribeCallbacks::on_ready(move || tracing::info!(sub = %ready_name, "subscription ready"))
            .with_error(move |e| tracing::warn!(sub = %error_name, error = %e, "subscription failed"));
        handles.push(conn.subscribe(&name, params, callbacks));
    }

    tracing::info!(server = %addr, subscriptions = handles.len(), "starting livedata tail");
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let transport = tokio::spawn(run_tcp(
        addr,
        conn.clone(),
        outgoing,
        Duration::from_millis(cfg.reconnect_delay_ms),
        shutdown_rx,
    ));

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    let _ = shutdown_tx.send(true);
    transport.await??;

    for local in &mirrors {
        tracing::info!(collection = %local.name(), docs = local.len(), "final state");
    }
    Ok(())
}

#[derive(Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum WriteCommand {
    Insert { doc: Value },
    Update { id: Value, update: Value },
    Remove { id: Value },
    Drop,
}

enum Writer {
    Memory(Arc<MemorySource>),
    Postgres(Arc<PgSource>),
}

fn json_doc(v: Value) -> anyhow::Result<Document> {
    match Bson::try_from(v)? {
        Bson::Document(d) => Ok(d),
        other => anyhow::bail!("expected a JSON object, got {other}"),
    }
}

fn json_id(v: Value) -> anyhow::Result<DocId> {
    let b = Bson::try_from(v)?;
    DocId::from_bson(&b).with_context(|| format!("unsupported _id {b}"))
}

impl Writer {
    async fn apply(&self, collection: &str, cmd: WriteCommand, fence: &WriteFence) -> anyhow::Result<()> {
        let fence = Some(fence);
        match (self, cmd) {
            (Writer::Memory(m), WriteCommand::Insert { doc }) => {
                m.insert(collection, json_doc(doc)?, fence)?;
            }
            (Writer::Postgres(p), WriteCommand::Insert { doc }) => {
                p.insert(collection, json_doc(doc)?, fence).await?;
            }
            (Writer::Memory(m), WriteCommand::Update { id, update }) => {
                m.update(collection, &json_id(id)?, &json_doc(update)?, fence)?;
            }
            (Writer::Postgres(p), WriteCommand::Update { id, update }) => {
                p.update(collection, &json_id(id)?, &json_doc(update)?, fence).await?;
            }
            (Writer::Memory(m), WriteCommand::Remove { id }) => {
                m.remove(collection, &json_id(id)?, fence)?;
            }
            (Writer::Postgres(p), WriteCommand::Remove { id }) => {
                p.remove(collection, &json_id(id)?, fence).await?;
            }
            (Writer::Memory(m), WriteCommand::Drop) => m.drop_collection(collection, fence),
            (Writer::Postgres(p), WriteCommand::Drop) => p.drop_collection(collection, fence).await?,
        }
        Ok(())
    }
}

async fn observe(
    cfg: Config,
    collection: String,
    selector: String,
    fields: Option<String>,
    postgres_url: Option<String>,
) -> anyhow::Result<()> {
    let selector = json_doc(serde_json::from_str(&selector).context("selector")?)?;
    let mut cursor = CursorDescription::new(collection.as_str(), selector);
    if let Some(fields) = fields {
        cursor = cursor.with_fields(json_doc(serde_json::from_str(&fields).context("fields")?)?);
    }

    let (oplog, _tailer) = OplogHandle::start();
    let (source, writer): (Arc<dyn DocumentSource>, Writer) = match postgres_url.or(cfg.postgres_url.clone()) {
        Some(url) => {
            let pg = Arc::new(PgSource::connect(&url, cfg.fetch_concurrency(), Some(oplog.clone())).await?);
            (pg.clone(), Writer::Postgres(pg))
        }
        None => {
            let mem = Arc::new(MemorySource::new(Some(oplog.clone())));
            (mem.clone(), Writer::Memory(mem))
        }
    };

    let multiplexer = Arc::new(ChannelMultiplexer::new());
    let mut events = multiplexer.add_handle();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ObserveEvent::Added { id, fields } => tracing::info!(id = %id, fields = %fields, "added"),
                ObserveEvent::Changed { id, fields } => tracing::info!(id = %id, fields = %fields, "changed"),
                ObserveEvent::Removed { id } => tracing::info!(id = %id, "removed"),
                ObserveEvent::Ready => tracing::info!("ready"),
            }
        }
    });

    tracing::info!(collection = %collection, selector = %cursor.selector, "starting livedata observe");
    let driver = OplogObserveDriver::spawn(DriverOptions {
        cursor,
        fetcher: Arc::new(CoalescingFetcher::new(source.clone())),
        source,
        oplog,
        multiplexer,
        fetch_concurrency: cfg.fetch_concurrency(),
    })?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                let cmd: WriteCommand = match serde_json::from_str(&line) {
                    Ok(cmd) => cmd,
                    Err(e) => {
                        tracing::warn!(error = %e, "invalid write command");
                        continue;
                    }
                };
                let fence = WriteFence::new();
                if let Err(e) = writer.apply(&collection, cmd, &fence).await {
                    tracing::warn!(error = %format!("{e:?}"), "write failed");
                }
                fence.arm_and_wait().await;
                tracing::debug!("write visible to observers");
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    driver.stop().await;
    driver.join().await?;
    printer.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_flags() {
        assert_eq!(parse_sub("tasks").unwrap(), ("tasks".to_string(), vec![]));
        assert_eq!(parse_sub("tasks:[1,\"a\"]").unwrap().1, vec![serde_json::json!(1), serde_json::json!("a")]);
        assert_eq!(parse_sub("room:{\"id\":3}").unwrap().1, vec![serde_json::json!({ "id": 3 })]);
        assert!(parse_sub("bad:{").is_err());
    }
}
