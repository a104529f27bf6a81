/*
Copyright (c) 2022 VMware, Inc.
SPDX-License-Identifier: MIT
Permission is hereby granted, free of charge, to any person obtaining a copy
of this software and associated documentation files (the "Software"), to deal
in the Software without restriction, including without limitation the rights
to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
copies of the Software, and to permit persons to whom the Software is
furnished to do so, subject to the following conditions:
The above copyright notice and this permission notice shall be included in all
copies or substantial portions of the Software.
THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
SOFTWARE.
 */

use clap::Parser;
use std::path::PathBuf;
use std::process;
use tracing::{event, Level};

use supervise::supervisor::Supervisor;

#[derive(Parser, Debug)]
#[clap(version, about)]
struct Args {
    /// Run the main service once: do not restart it after it exits.
    #[clap(short = 'o', long)]
    once: bool,

    /// Service definition directory to supervise.
    svdir: PathBuf,
}

fn main() {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();
    let args = Args::parse();

    event!(Level::INFO, "starting ...");

    // SIGPIPE must not kill us when a control client disappears between its
    // request and our reply.  Children get the default disposition back.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    let mut supervisor = match Supervisor::new(&args.svdir, args.once) {
        Ok(supervisor) => supervisor,
        Err(e) => {
            event!(Level::ERROR, "{}: {e:#}", args.svdir.display());
            process::exit(100);
        }
    };

    // No fatals beyond this point.
    supervisor.boot();
    supervisor.main_loop();

    event!(Level::INFO, "terminating normally");
}
