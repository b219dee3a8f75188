//! offrecord demo harness
//!
//! Drives two local accounts through key exchange and message delivery over
//! an in-process queue, printing what each side's application would see.

use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::{fmt as log_fmt, EnvFilter};

use offrecord::{
    Advisory, AppCallbacks, Engine, HarnessConfig, Inbound, MessageState, OtrError, Policy,
    PolicyTable, ProtocolVersion, SessionId, StateChange, UnreadableReason, UserState,
};

const ALICE: &str = "oneeyedian";
const BOB: &str = "otr4ian";
const PROTOCOL: &str = "prpl-oscar";

/// Deliveries allowed in one dispatch before the run is declared stuck
const MAX_DELIVERIES: usize = 256;

/// Which conversations to drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Scenario {
    /// Every scenario below, in order
    All,
    /// Version 1 exchange started by Alice
    V1,
    /// Version 2 exchange started by Alice
    V2,
    /// Version 1 exchange started by both sides at once
    SimultaneousV1,
    /// Version 2 exchange started by both sides at once
    SimultaneousV2,
    /// Bob drops his keys, then Alice sends encrypted text
    Unreadable,
}

/// offrecord - Off-the-record messaging demo harness
#[derive(Parser, Debug)]
#[command(name = "offrecord")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to an accounts file (keys are generated when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Print the event transcript as JSON instead of text
    #[arg(long)]
    json: bool,

    /// Scenario to run
    #[arg(short, long, value_enum, default_value_t = Scenario::All)]
    scenario: Scenario,
}

fn main() -> ExitCode {
    let args = Args::parse();

    // Logs go to stderr so the transcript on stdout stays clean
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if args.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("warn")
        }
    });

    log_fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run(args) {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", user_message(&e));
            exit_code(&e)
        }
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let config = match &args.config {
        Some(path) => {
            tracing::info!("Loading accounts from: {}", path.display());
            HarnessConfig::from_file(path)
                .map_err(OtrError::from)
                .with_context(|| format!("loading {}", path.display()))?
        }
        None => HarnessConfig::default(),
    };

    let user_state = UserState::with_config(config.engine);
    config.install_keys(&user_state);
    for account in [ALICE, BOB] {
        if user_state.key_for(account, PROTOCOL).is_none() {
            user_state.generate_key(account, PROTOCOL);
        }
    }

    let setup = Setup {
        user_state,
        policies: config.policy_table(),
        mailbox: Mailbox::new(!args.json),
    };

    let plan: &[Scenario] = match args.scenario {
        Scenario::All => &[
            Scenario::V1,
            Scenario::V2,
            Scenario::SimultaneousV1,
            Scenario::SimultaneousV2,
            Scenario::Unreadable,
        ],
        // Needs an established session to break
        Scenario::Unreadable => &[Scenario::V2, Scenario::Unreadable],
        ref single => std::slice::from_ref(single),
    };

    let mut reports = Vec::with_capacity(plan.len());
    for scenario in plan {
        let report = match scenario {
            Scenario::V1 => setup.key_exchange(ProtocolVersion::V1, false)?,
            Scenario::V2 => setup.key_exchange(ProtocolVersion::V2, false)?,
            Scenario::SimultaneousV1 => setup.key_exchange(ProtocolVersion::V1, true)?,
            Scenario::SimultaneousV2 => setup.key_exchange(ProtocolVersion::V2, true)?,
            Scenario::Unreadable => setup.unreadable()?,
            Scenario::All => continue,
        };
        reports.push(report);
    }

    if args.json {
        let transcript =
            serde_json::to_string_pretty(&reports).context("serializing transcript")?;
        println!("{}", transcript);
    } else {
        for report in &reports {
            println!("{}: {}", report.name, if report.passed { "ok" } else { "FAILED" });
        }
    }

    let failed = reports.iter().filter(|r| !r.passed).count();
    if failed > 0 {
        bail!("{} of {} scenarios failed", failed, reports.len());
    }
    Ok(())
}

/// One thing either application observed
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum Event {
    Injected {
        from: String,
        to: String,
        message: String,
    },
    StateChanged {
        change: StateChange,
    },
    Unreadable {
        session: SessionId,
        reason: UnreadableReason,
    },
    Advisory {
        session: SessionId,
        advisory: Advisory,
    },
    Delivered {
        from: String,
        to: String,
        text: String,
        encrypted: bool,
    },
    Refused {
        from: String,
        to: String,
        error: String,
    },
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Injected { from, to, message } => write!(f, "[{}->{}: {}]", from, to, message),
            Self::StateChanged { change } => write!(f, "{}", change),
            Self::Unreadable { session, reason } => write!(f, "UNREADABLE: {}: {}", session, reason),
            Self::Advisory { session, advisory } => write!(f, "NOTICE: {}: {}", session, advisory),
            Self::Delivered { from, text, .. } => write!(f, "{}> {}", from, text),
            Self::Refused { from, to, error } => write!(f, "REFUSED: {}->{}: {}", from, to, error),
        }
    }
}

#[derive(Debug, Serialize)]
struct ScenarioReport {
    name: String,
    passed: bool,
    events: Vec<Event>,
}

struct Delivery {
    from: String,
    to: String,
    message: String,
}

/// Fake wire plus transcript; also the host callbacks for both accounts
struct Mailbox {
    queue: Mutex<VecDeque<Delivery>>,
    events: Mutex<Vec<Event>>,
    echo: bool,
}

impl Mailbox {
    fn new(echo: bool) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            events: Mutex::new(Vec::new()),
            echo,
        }
    }

    fn record(&self, event: Event) {
        if self.echo {
            println!("{}\n", event);
        }
        lock(&self.events).push(event);
    }

    fn inject(&self, from: &str, to: &str, message: String) {
        self.record(Event::Injected {
            from: from.to_string(),
            to: to.to_string(),
            message: message.clone(),
        });
        lock(&self.queue).push_back(Delivery {
            from: from.to_string(),
            to: to.to_string(),
            message,
        });
    }

    fn next(&self) -> Option<Delivery> {
        lock(&self.queue).pop_front()
    }

    fn take_events(&self) -> Vec<Event> {
        std::mem::take(&mut *lock(&self.events))
    }
}

impl AppCallbacks for Mailbox {
    fn inject_message(&self, session: &SessionId, message: &str) {
        self.inject(&session.account, &session.peer, message.to_string());
    }

    fn state_changed(&self, change: &StateChange) {
        self.record(Event::StateChanged {
            change: change.clone(),
        });
    }

    fn unreadable_message(&self, session: &SessionId, reason: &UnreadableReason) {
        self.record(Event::Unreadable {
            session: session.clone(),
            reason: reason.clone(),
        });
    }

    fn display_advisory(&self, session: &SessionId, advisory: &Advisory) {
        self.record(Event::Advisory {
            session: session.clone(),
            advisory: advisory.clone(),
        });
    }
}

/// An engine wired to the mailbox
struct Harness<'a> {
    engine: Engine<'a>,
    mailbox: &'a Mailbox,
}

impl Harness<'_> {
    fn sending(&self, from: &str, to: &str, text: &str) {
        let session = SessionId::new(from, to, PROTOCOL);
        match self.engine.send(&session, text) {
            Ok(wire) => self.mailbox.inject(from, to, wire),
            Err(e) => self.mailbox.record(Event::Refused {
                from: from.to_string(),
                to: to.to_string(),
                error: e.user_message(),
            }),
        }
    }

    fn receiving(&self, delivery: Delivery) {
        let session = SessionId::new(&delivery.to, &delivery.from, PROTOCOL);
        if let Inbound::Message {
            text, encrypted, ..
        } = self.engine.receive(&session, &delivery.message)
        {
            self.mailbox.record(Event::Delivered {
                from: delivery.from,
                to: delivery.to,
                text,
                encrypted,
            });
        }
    }

    /// Deliver queued messages until the wire is quiet
    fn dispatch(&self) -> anyhow::Result<()> {
        let mut delivered = 0;
        while let Some(delivery) = self.mailbox.next() {
            delivered += 1;
            if delivered > MAX_DELIVERIES {
                bail!("message exchange did not settle after {} deliveries", MAX_DELIVERIES);
            }
            self.receiving(delivery);
        }
        Ok(())
    }
}

struct Setup {
    user_state: UserState,
    policies: PolicyTable,
    mailbox: Mailbox,
}

impl Setup {
    fn harness<'a>(&'a self, policies: &'a PolicyTable) -> Harness<'a> {
        Harness {
            engine: Engine::new(&self.user_state, policies, &self.mailbox),
            mailbox: &self.mailbox,
        }
    }

    fn banner(&self, name: &str) {
        if self.mailbox.echo {
            println!("\n\n*** Testing {} ***\n", name);
        }
    }

    /// Alice queries Bob (and Bob queries Alice, if simultaneous), then says hi
    fn key_exchange(
        &self,
        version: ProtocolVersion,
        simultaneous: bool,
    ) -> anyhow::Result<ScenarioReport> {
        let name = format!(
            "version {}, {}",
            version.as_u16(),
            if simultaneous { "simultaneous start" } else { "Alice start" }
        );
        self.banner(&name);

        self.user_state.forget_all();
        let mut policies = self.policies.clone();
        let alice_policy = match version {
            ProtocolVersion::V1 => Policy::DEFAULT & !Policy::ALLOW_V2,
            ProtocolVersion::V2 => Policy::DEFAULT,
        };
        policies.set(ALICE, alice_policy);

        let harness = self.harness(&policies);
        harness.sending(ALICE, BOB, "?OTR?");
        if simultaneous {
            harness.sending(BOB, ALICE, "?OTR?");
        }
        harness.dispatch()?;
        harness.sending(ALICE, BOB, "Hi there");
        harness.dispatch()?;

        let alice = harness.engine.session(&SessionId::new(ALICE, BOB, PROTOCOL));
        let bob_id = SessionId::new(BOB, ALICE, PROTOCOL);
        let bob = harness.engine.session(&bob_id);
        let events = self.mailbox.take_events();

        let keys_agree = match (&alice, &bob) {
            (Some(alice), Some(bob)) => {
                alice.msg_state == MessageState::Encrypted
                    && bob.msg_state == MessageState::Encrypted
                    && alice.version == Some(version)
                    && alice.ssid.is_some()
                    && alice.ssid == bob.ssid
            }
            _ => false,
        };
        let passed = keys_agree && secure_before(&events, &bob_id, "Hi there");

        Ok(ScenarioReport {
            name,
            passed,
            events,
        })
    }

    /// Bob forgets his keys; Alice's next encrypted message must be unreadable
    fn unreadable(&self) -> anyhow::Result<ScenarioReport> {
        let name = "Bob receiving unreadable messages from Alice".to_string();
        self.banner(&name);

        let harness = self.harness(&self.policies);
        let bob_id = SessionId::new(BOB, ALICE, PROTOCOL);
        harness.engine.force_plaintext(&bob_id);
        harness.sending(ALICE, BOB, "unreadable text");
        harness.dispatch()?;

        let events = self.mailbox.take_events();
        let reported = events.iter().any(|e| {
            matches!(e, Event::Unreadable { session, reason }
                if *session == bob_id && *reason == UnreadableReason::NotPrivate)
        });
        let leaked = events
            .iter()
            .any(|e| matches!(e, Event::Delivered { text, .. } if text.contains("unreadable text")));

        Ok(ScenarioReport {
            name,
            passed: reported && !leaked,
            events,
        })
    }
}

/// Did `session` go secure before `text` reached it encrypted?
fn secure_before(events: &[Event], session: &SessionId, text: &str) -> bool {
    let secure = events.iter().position(|e| {
        matches!(e, Event::StateChanged { change }
            if change.session == *session && change.new == MessageState::Encrypted)
    });
    let delivered = events.iter().position(|e| {
        matches!(e, Event::Delivered { to, text: t, encrypted: true, .. }
            if *to == session.account && t == text)
    });
    matches!((secure, delivered), (Some(s), Some(d)) if s < d)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Get user-friendly error message
fn user_message(error: &anyhow::Error) -> String {
    match error.downcast_ref::<OtrError>() {
        Some(err) => err.user_message(),
        None => format!("{:#}", error),
    }
}

/// Get exit code for error
fn exit_code(error: &anyhow::Error) -> ExitCode {
    match error.downcast_ref::<OtrError>() {
        Some(OtrError::Config(_)) => ExitCode::from(1),
        Some(OtrError::System(_)) => ExitCode::from(3),
        Some(OtrError::Protocol(_)) => ExitCode::from(4),
        Some(OtrError::Crypto(_)) => ExitCode::from(5),
        None => ExitCode::from(2),
    }
}
