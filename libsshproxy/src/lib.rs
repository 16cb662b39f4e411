// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    io,
    sync::Mutex,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use clap::Parser;
pub use errors::GatewayError;
use tracing_subscriber::fmt::format::FmtSpan;

mod checker;
mod config;
mod consts;
mod coord;
mod duration;
pub mod errors;
mod nodeset;
mod recorder;
mod resolver;
mod scope;
mod selector;
mod session;
mod supervisor;
mod tty;
mod user;

use config::load::LoadArgs;
use coord::{etcd, Client};
use nodeset::BracketExpander;
use session::SessionContext;

/// The command line arguments `sshproxy` expects. sshd invokes this
/// binary the same way on every connection (as the forced command), so
/// there are no subcommands: just an optional config file override and
/// `--version`.
///
/// NOTE: callers must check `version()` and handle it themselves, same
/// as the rest of the crate's entry points. Clap's own `--version`
/// support doesn't fit a library surface.
#[derive(Parser, Debug)]
#[clap(author, about)]
pub struct Args {
    #[clap(help = "policy file to load, overriding the compiled-in default")]
    pub config_file: Option<String>,

    #[clap(long, action, help = "print version and exit")]
    pub version: bool,
}

impl Args {
    pub fn version(&self) -> bool {
        self.version
    }
}

/// Runs one forced-command session end to end and returns the process
/// exit code the wrapping binary should exit with.
pub fn run(args: Args) -> anyhow::Result<i32> {
    let now_ns = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos() as u64;

    let info = user::info().context("resolving caller identity")?;
    let session = SessionContext::from_env(info.user, info.groups, now_ns)?;

    let config_path = args.config_file.as_deref().unwrap_or(consts::DEFAULT_CONFIG_PATH);
    let expander = BracketExpander;
    let policy = config::load::load(LoadArgs {
        path: config_path,
        user: &session.user,
        groups: &session.groups,
        sshd_addr: session.dst,
        session_id: &session.session_id,
        time_rfc3339: &session.start_time_rfc3339(),
        expander: &expander,
    })?;

    init_logging(&policy.log, policy.debug)?;

    let client = build_client(&policy)?;

    let user_key = session.user_key(&policy.service);
    let dest = match resolver::resolve(&policy, &user_key, client.as_ref()) {
        Ok(dest) => dest,
        Err(e) if e.downcast_ref::<GatewayError>() == Some(&GatewayError::NoDestination) => {
            print_banner(client.as_ref(), &policy.error_banner);
            return Ok(GatewayError::NoDestination.exit_code());
        }
        Err(e) => return Err(e),
    };

    let sshd_hostport = session.dst.to_string();
    supervisor::run(&policy, &session, &sshd_hostport, &dest, client)
}

/// Picks the banner shown to a user with no reachable destination: the
/// etcd-configured one takes precedence over the static config fallback.
fn print_banner(client: Option<&std::sync::Arc<dyn Client>>, fallback: &str) {
    let banner = client
        .filter(|c| c.is_alive())
        .and_then(|c| c.get_error_banner().ok())
        .filter(|b| !b.is_empty())
        .unwrap_or_else(|| fallback.to_string());
    if !banner.is_empty() {
        eprintln!("{banner}");
    }
}

fn build_client(policy: &config::EffectivePolicy) -> anyhow::Result<Option<std::sync::Arc<dyn Client>>> {
    let Some(section) = &policy.etcd else {
        return Ok(None);
    };
    let Some(endpoints) = &section.endpoints else {
        return Ok(None);
    };

    let cfg = etcd::EtcdConfig {
        endpoints: endpoints.clone(),
        username: section.username.clone(),
        password: section.password.clone(),
        tls: if section.tls.cafile.is_some() || section.tls.certfile.is_some() {
            Some(etcd::TlsConfig {
                ca_file: section.tls.cafile.clone(),
                cert_file: section.tls.certfile.clone(),
                key_file: section.tls.keyfile.clone(),
            })
        } else {
            None
        },
        keyttl_secs: policy.etcd_keyttl,
    };

    let mandatory = section.mandatory.unwrap_or(false);
    match etcd::EtcdClient::connect(&cfg) {
        Ok(c) => Ok(Some(std::sync::Arc::new(c))),
        Err(e) => {
            etcd::mandatory_error(mandatory, e)?;
            Ok(None)
        }
    }
}

/// Wires the effective policy's `log` key (`"stdout"`, `"syslog"`, or a
/// file path) to a `tracing_subscriber` `fmt` layer. `debug` toggles the
/// max level between `INFO` and `DEBUG`.
fn init_logging(log: &str, debug: bool) -> anyhow::Result<()> {
    let level = if debug { tracing::Level::DEBUG } else { tracing::Level::INFO };

    let builder = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_thread_ids(true)
        .with_target(false)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE);

    match log {
        "" | "stdout" => {
            builder.with_writer(io::stdout).init();
        }
        "syslog" => {
            let formatter = syslog::Formatter3164 {
                facility: syslog::Facility::LOG_AUTHPRIV,
                hostname: None,
                process: "sshproxy".into(),
                pid: std::process::id(),
            };
            let logger = syslog::unix(formatter).context("connecting to syslog")?;
            builder.with_writer(Mutex::new(logger)).init();
        }
        path => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file '{path}'"))?;
            builder.with_writer(Mutex::new(file)).init();
        }
    }

    Ok(())
}
