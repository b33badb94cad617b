use crate::auth_results::AuthResultsReader;
use crate::config::Config;
use crate::ignore_list::{IgnoreList, IgnoreListHandle};
use crate::pipeline::KnownSenders;
use crate::relay::RelayPolicy;
use crate::store::{ReputationClient, ReputationStore};
use crate::transaction::{ConnectionInfo, DkimVerdict, FcrdnsVerdict, Session};
use indymilter::{
    run, Actions, Callbacks, Config as IndyConfig, Context, ContextActions, EomContext, SocketInfo,
    Status,
};
use std::ffi::CString;
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixListener;

/// Per-connection milter state.
struct MilterSession {
    session: Session,
    /// Trusted Authentication-Results headers seen in the current message.
    trusted_headers: usize,
}

/// What to do with a message once its stages have run.
#[derive(Debug, Default, PartialEq, Eq)]
struct MessageVerdict {
    /// Annotation rendered as JSON, present when it is flagged for emission.
    json: Option<String>,
    header: Option<String>,
}

struct Engine {
    plugin: KnownSenders,
    relay: RelayPolicy,
    auth_results: AuthResultsReader,
    add_header: bool,
    header_name: String,
}

impl Engine {
    fn new(
        config: &Config,
        store: Arc<dyn ReputationStore>,
        ignore: Arc<IgnoreListHandle>,
    ) -> anyhow::Result<Self> {
        let client = ReputationClient::new(store, Duration::from_millis(config.store.timeout_ms));
        let auth_results = AuthResultsReader::new(config.milter.authserv_id.as_deref())?;
        if !auth_results.is_enabled() {
            log::warn!("milter.authserv_id not set, DKIM verdicts will not be read from headers");
        }

        Ok(Engine {
            plugin: KnownSenders::new(client, ignore),
            relay: RelayPolicy::from_config(&config.relay)?,
            auth_results,
            add_header: config.milter.add_header,
            header_name: config.milter.header_name.clone(),
        })
    }

    fn connect(&self, hostname: &str, remote_ip: Option<IpAddr>) -> MilterSession {
        let relaying = self.relay.is_relaying(remote_ip, None);
        log::debug!("Connection from: {hostname} ({remote_ip:?}), relaying: {relaying}");

        MilterSession {
            session: Session::new(ConnectionInfo {
                relaying,
                remote_ip,
                fcrdns: verified_client_name(hostname).map(FcrdnsVerdict::new),
                spf_helo: None,
            }),
            trusted_headers: 0,
        }
    }

    fn mail(&self, state: &mut MilterSession, mail_from: Option<&str>, auth_authen: Option<&str>) {
        let session = &mut state.session;
        if !session.connection.relaying
            && self
                .relay
                .is_relaying(session.connection.remote_ip, auth_authen)
        {
            session.connection.relaying = true;
        }

        log::debug!("Mail from: {mail_from:?}");
        state.trusted_headers = 0;
        session.begin_transaction(mail_from, self.plugin.ignore_snapshot());

        if let Some(txn) = session.transaction() {
            let outcome = self.plugin.is_authenticated(&session.connection, txn);
            session.apply(outcome);
        }
    }

    async fn rcpt(&self, state: &mut MilterSession, rcpt: &str) {
        let session = &mut state.session;
        let Some(txn) = session.transaction_mut() else {
            log::error!("check_recipient: no transaction");
            return;
        };
        log::debug!("Rcpt to: {rcpt}");
        txn.rcpt_to.push(rcpt.to_string());

        if let Some(txn) = session.transaction() {
            let outcome = self
                .plugin
                .check_recipient(&session.connection, txn, rcpt)
                .await;
            session.apply(outcome);
        }
    }

    /// Collect DKIM verdicts. A message carrying more than one trusted
    /// Authentication-Results header has at least one forged, so none are used.
    fn header(&self, state: &mut MilterSession, name: &str, value: &str) {
        if !name.eq_ignore_ascii_case("Authentication-Results") {
            return;
        }
        let Some(domains) = self.auth_results.dkim_pass_domains(value) else {
            return;
        };
        let Some(txn) = state.session.transaction_mut() else {
            return;
        };

        state.trusted_headers += 1;
        if state.trusted_headers > 1 {
            if state.trusted_headers == 2 {
                log::warn!("several trusted Authentication-Results headers, ignoring DKIM verdicts");
            }
            txn.dkim = None;
            return;
        }

        log::debug!("dkim pass: {domains:?}");
        txn.dkim = Some(DkimVerdict { pass: domains });
    }

    async fn end_of_message(&self, state: &mut MilterSession) -> MessageVerdict {
        let session = &mut state.session;
        let Some(txn) = session.transaction() else {
            log::error!("eom: no transaction");
            return MessageVerdict::default();
        };

        let outcome = if session.connection.relaying {
            self.plugin.update_sender(&session.connection, txn).await
        } else {
            self.plugin
                .is_dkim_authenticated(&session.connection, txn)
                .await
        };
        session.apply(outcome);

        let mut verdict = MessageVerdict::default();
        if let Some(txn) = session.transaction_mut() {
            txn.complete();
            if let Some(annotation) = txn.annotation(KnownSenders::NAME) {
                if annotation.emit {
                    match serde_json::to_string(annotation) {
                        Ok(json) => verdict.json = Some(json),
                        Err(e) => {
                            log::warn!("{}: cannot render annotation: {e}", KnownSenders::NAME)
                        }
                    }
                }
                if self.add_header {
                    verdict.header = annotation.header_value();
                }
            }
        }
        verdict
    }

    fn abort(&self, state: &mut MilterSession) {
        state.session.end_transaction();
        state.trusted_headers = 0;
    }
}

pub struct Milter {
    engine: Arc<Engine>,
    ignore: Arc<IgnoreListHandle>,
}

impl Milter {
    pub fn new(config: &Config, store: Arc<dyn ReputationStore>) -> anyhow::Result<Self> {
        let ignore = Arc::new(IgnoreListHandle::new(IgnoreList::new(
            config.ignored_ods.iter().cloned(),
        )?));
        let engine = Engine::new(config, store, ignore.clone())?;
        Ok(Milter {
            engine: Arc::new(engine),
            ignore,
        })
    }

    /// Handle used to swap the ignore list on reload.
    pub fn ignore_list(&self) -> Arc<IgnoreListHandle> {
        self.ignore.clone()
    }

    pub async fn run(
        &self,
        socket_path: &str,
        shutdown: impl Future + Send,
    ) -> anyhow::Result<()> {
        log::info!(
            "Starting known-senders milter on: {} (store: {})",
            socket_path,
            self.engine.plugin.client().store_name()
        );
        if std::path::Path::new(socket_path).exists() {
            std::fs::remove_file(socket_path)?;
        }
        let listener = UnixListener::bind(socket_path)?;

        let callbacks: Callbacks<MilterSession> = Callbacks::new()
            .on_connect({
                let engine = self.engine.clone();
                move |ctx, hostname, socket_info| {
                    let engine = engine.clone();
                    Box::pin(async move { handle_connect(&engine, ctx, hostname, socket_info) })
                }
            })
            .on_mail({
                let engine = self.engine.clone();
                move |ctx, args| {
                    let engine = engine.clone();
                    Box::pin(async move { handle_mail(&engine, ctx, args) })
                }
            })
            .on_rcpt({
                let engine = self.engine.clone();
                move |ctx, args| {
                    let engine = engine.clone();
                    Box::pin(async move { handle_rcpt(&engine, ctx, args).await })
                }
            })
            .on_header({
                let engine = self.engine.clone();
                move |ctx, name, value| {
                    let engine = engine.clone();
                    Box::pin(async move {
                        if let Some(state) = ctx.data.as_mut() {
                            engine.header(state, &name.to_string_lossy(), &value.to_string_lossy());
                        }
                        Status::Continue
                    })
                }
            })
            .on_eom({
                let engine = self.engine.clone();
                move |ctx| {
                    let engine = engine.clone();
                    Box::pin(async move { handle_eom(&engine, ctx).await })
                }
            })
            .on_abort({
                let engine = self.engine.clone();
                move |ctx| {
                    let engine = engine.clone();
                    Box::pin(async move {
                        if let Some(state) = ctx.data.as_mut() {
                            engine.abort(state);
                        }
                        Status::Continue
                    })
                }
            })
            .on_close(|ctx| {
                Box::pin(async move {
                    ctx.data = None;
                    Status::Continue
                })
            });

        let config = IndyConfig {
            actions: Actions::ADD_HEADER,
            ..Default::default()
        };

        run(listener, callbacks, config, shutdown).await?;
        Ok(())
    }
}

/// The MTA reports the client hostname only once it is forward-confirmed;
/// otherwise it sends `unknown` or the bracketed address.
fn verified_client_name(hostname: &str) -> Option<&str> {
    let hostname = hostname.trim();
    if hostname.is_empty() || hostname.eq_ignore_ascii_case("unknown") || hostname.starts_with('[') {
        return None;
    }
    Some(hostname)
}

fn first_arg(args: &[CString]) -> Option<String> {
    args.first().map(|arg| arg.to_string_lossy().into_owned())
}

fn handle_connect(
    engine: &Engine,
    ctx: &mut Context<MilterSession>,
    hostname: CString,
    socket_info: SocketInfo,
) -> Status {
    let remote_ip = match socket_info {
        SocketInfo::Inet(addr) => Some(addr.ip()),
        _ => None,
    };
    ctx.data = Some(engine.connect(&hostname.to_string_lossy(), remote_ip));
    Status::Continue
}

fn handle_mail(engine: &Engine, ctx: &mut Context<MilterSession>, args: Vec<CString>) -> Status {
    let auth_authen = ctx
        .macros
        .get(c"{auth_authen}")
        .map(|login| login.to_string_lossy().into_owned());
    let Some(state) = ctx.data.as_mut() else {
        log::error!("is_authenticated: no connection");
        return Status::Continue;
    };
    engine.mail(state, first_arg(&args).as_deref(), auth_authen.as_deref());
    Status::Continue
}

async fn handle_rcpt(
    engine: &Engine,
    ctx: &mut Context<MilterSession>,
    args: Vec<CString>,
) -> Status {
    let Some(state) = ctx.data.as_mut() else {
        log::error!("check_recipient: no connection");
        return Status::Continue;
    };
    if let Some(rcpt) = first_arg(&args) {
        engine.rcpt(state, &rcpt).await;
    }
    Status::Continue
}

async fn handle_eom(engine: &Engine, ctx: &mut EomContext<MilterSession>) -> Status {
    let Some(state) = ctx.data.as_mut() else {
        log::error!("eom: no connection");
        return Status::Continue;
    };

    let verdict = engine.end_of_message(state).await;
    if let Some(json) = verdict.json {
        log::info!("{}: {json}", KnownSenders::NAME);
    }
    if let Some(value) = verdict.header {
        if let Err(e) = ctx
            .actions
            .add_header(engine.header_name.clone(), value)
            .await
        {
            log::error!("Failed to add header: {e}");
        }
    }
    Status::Continue
}
