// Copyright 2022 jmjoy
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

//! FastCGI pool supervisor command.
//!
//! Binds the webserver socket as root, chroots, drops privileges, and
//! keeps a pool of responder processes alive:
//!
//! ```text
//! sepcgi-pool [-drv] [-l backlog] [-n workers] [-N maxworkers]
//!             [-p chroot] [-s sockpath] [-u sockuser] [-U procuser]
//!             [-w seconds] -- prog [args...]
//! ```

use getopts::Options;
use sepcgi::manager::{self, PoolConfig};
use std::{env, process::ExitCode, time::Duration};
use tracing::{Level, error};
use tracing_subscriber::FmtSubscriber;

fn usage(program: &str, opts: &Options) -> String {
    opts.usage(&format!(
        "Usage: {program} [-drv] [options] -- prog [args...]"
    ))
}

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    let program = args[0].clone();

    let mut opts = Options::new();
    opts.optopt("n", "", "base pool size", "WORKERS");
    opts.optopt("N", "", "maximum pool size (variable pool)", "MAX");
    opts.optopt("l", "", "listen backlog", "BACKLOG");
    opts.optopt("p", "", "chroot directory", "CHROOT");
    opts.optopt("s", "", "webserver socket path", "SOCKPATH");
    opts.optopt("u", "", "socket owner (webserver user)", "SOCKOWNER");
    opts.optopt("U", "", "responder process owner", "PROCOWNER");
    opts.optflag("r", "", "variable pool with descriptor passing");
    opts.optopt("w", "", "idle seconds before the pool shrinks", "SECONDS");
    opts.optflag("d", "", "do not daemonize");
    opts.optflag("v", "", "verbose logging");
    opts.optflag("h", "help", "print this help");

    let matches = match opts.parse(&args[1..]) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("{program}: {e}");
            eprintln!("{}", usage(&program, &opts));
            return ExitCode::FAILURE;
        }
    };
    if matches.opt_present("h") || matches.free.is_empty() {
        eprintln!("{}", usage(&program, &opts));
        return ExitCode::FAILURE;
    }

    let level = if matches.opt_present("v") {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("{program}: failed to install logger");
        return ExitCode::FAILURE;
    }

    let mut cfg = PoolConfig {
        argv: matches.free.clone(),
        daemonize: !matches.opt_present("d"),
        variable: matches.opt_present("r"),
        ..PoolConfig::default()
    };

    macro_rules! numeric {
        ($flag:expr, $field:expr) => {
            if let Some(v) = matches.opt_str($flag) {
                match v.parse() {
                    Ok(v) => $field = v,
                    Err(_) => {
                        eprintln!("{program}: -{} expects a number", $flag);
                        return ExitCode::FAILURE;
                    }
                }
            }
        };
    }
    numeric!("n", cfg.workers);
    numeric!("N", cfg.max_workers);
    numeric!("l", cfg.backlog);
    if let Some(v) = matches.opt_str("w") {
        match v.parse() {
            Ok(secs) => cfg.idle_grace = Duration::from_secs(secs),
            Err(_) => {
                eprintln!("{program}: -w expects seconds");
                return ExitCode::FAILURE;
            }
        }
    }
    if let Some(p) = matches.opt_str("p") {
        cfg.chroot = p.into();
    }
    if let Some(s) = matches.opt_str("s") {
        cfg.sockpath = s.into();
    }
    cfg.sock_user = matches.opt_str("u");
    cfg.proc_user = matches.opt_str("U");
    if cfg.max_workers < cfg.workers {
        cfg.max_workers = cfg.workers;
    }

    match manager::run(&cfg) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "supervisor failed");
            ExitCode::FAILURE
        }
    }
}
