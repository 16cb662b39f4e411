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
/// sshproxy is installed as an sshd forced command: it picks a backend
/// host for the inbound session, spawns and supervises a child ssh
/// client, and records the session.
use clap::Parser;
use libsshproxy::GatewayError;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() {
    let args = libsshproxy::Args::parse();

    if args.version() {
        println!("sshproxy {VERSION}");
        std::process::exit(0);
    }

    let code = match libsshproxy::run(args) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("sshproxy: {err:#}");
            err.downcast_ref::<GatewayError>().map(GatewayError::exit_code).unwrap_or(1)
        }
    };

    std::process::exit(code);
}
