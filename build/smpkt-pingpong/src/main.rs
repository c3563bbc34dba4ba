// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated CPUs, one thread each, sharing a single window.
//!
//! CPU 0 formats the region and keeps its heartbeat going. It then pings
//! CPU 1, which answers every ping, and finishes by broadcasting a goodbye
//! to every CPU. Doorbells are thread unparks, and a tick is a millisecond.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread::{self, Thread};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use serde::Deserialize;
use smpkt::{
    CpuSel, Dest, NotifyFailed, NotifyKind, NotifyMethod, Packet, PktConfig,
    Platform, SetupConfig, SmMem, SmPktDesc, SmPktError, MASTER_CPU,
};

const PING: u32 = 1;
const PONG: u32 = 2;
const BYE: u32 = 3;

/// Where the region starts in the window, leaving room for the anchor.
const REGION_AT: usize = 64;

#[derive(Debug, Parser)]
#[clap(max_term_width = 80, about = "Shared-memory packet ping-pong")]
struct Args {
    /// Board configuration (TOML), with optional `setup` and `node` tables
    #[clap(short, long)]
    config: Option<PathBuf>,
    /// Size of the packet region, in KiB
    #[clap(long, default_value_t = 64)]
    region_kib: usize,
    /// Number of CPUs to run, at least two
    #[clap(long, default_value_t = 4)]
    cpus: u16,
    /// Ping-pong exchanges before the goodbye
    #[clap(short, long, default_value_t = 1000)]
    rounds: u32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct Board {
    setup: SetupConfig,
    node: PktConfig,
}

#[derive(Clone)]
struct Host {
    threads: Arc<Mutex<Vec<Option<Thread>>>>,
    rung: Arc<Vec<AtomicU32>>,
    /// Set when any node gives up, so the others stop waiting on it.
    abort: Arc<AtomicBool>,
}

impl Host {
    fn new(cpus: u16) -> Self {
        Self {
            threads: Arc::new(Mutex::new(vec![None; usize::from(cpus)])),
            rung: Arc::new((0..cpus).map(|_| AtomicU32::new(0)).collect()),
            abort: Arc::default(),
        }
    }

    fn check(&self) -> Result<()> {
        if self.abort.load(Ordering::Relaxed) {
            bail!("another node failed");
        }
        Ok(())
    }

    /// Stops everyone, waking any node parked in `wait_recv`.
    fn fail(&self) {
        self.abort.store(true, Ordering::Relaxed);
        if let Ok(threads) = self.threads.lock() {
            threads.iter().flatten().for_each(Thread::unpark);
        }
    }

    fn register(&self, cpu: u16) {
        if let Ok(mut threads) = self.threads.lock() {
            threads[usize::from(cpu)] = Some(thread::current());
        }
    }
}

impl Platform for Host {
    fn notify(&self, cpu: u16, _: &NotifyMethod) -> Result<(), NotifyFailed> {
        let threads = self.threads.lock().map_err(|_| NotifyFailed)?;
        let target = threads
            .get(usize::from(cpu))
            .and_then(Option::as_ref)
            .ok_or(NotifyFailed)?;
        target.unpark();
        self.rung[usize::from(cpu)].fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn delay(&self, ticks: u32) {
        thread::sleep(Duration::from_millis(ticks.into()));
    }
}

fn get_free(d: &mut SmPktDesc<Host>) -> Result<Packet> {
    loop {
        d.platform().check()?;
        match d.free_get() {
            Ok(Some(p)) => return Ok(p),
            Ok(None) | Err(SmPktError::LockTimeout) => thread::yield_now(),
            Err(e) => return Err(e.into()),
        }
    }
}

/// Waits for a packet, sleeping until rung between empty polls.
fn wait_recv(d: &mut SmPktDesc<Host>) -> Result<Packet> {
    loop {
        d.platform().check()?;
        match d.recv() {
            Ok(Some(p)) => return Ok(p),
            Ok(None) | Err(SmPktError::LockTimeout) => {
                thread::park_timeout(Duration::from_millis(10))
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn send(d: &mut SmPktDesc<Host>, mut p: Packet, to: u16) -> Result<()> {
    loop {
        d.platform().check()?;
        match d.send(p, Dest::Cpu(to)) {
            Ok(()) => return Ok(()),
            Err(e) => match (e.error, e.packet) {
                (
                    SmPktError::ListFull | SmPktError::LockTimeout,
                    Some(back),
                ) => {
                    p = back;
                    thread::yield_now();
                }
                (SmPktError::NotifyIncomplete, None) => {
                    eprintln!("cpu {}: doorbell to {to} failed", d.cpu());
                    return Ok(());
                }
                (error, _) => {
                    return Err(error).context(format!("sending to {to}"))
                }
            },
        }
    }
}

fn ping(d: &mut SmPktDesc<Host>, rounds: u32) -> Result<()> {
    for n in 0..rounds {
        let mut p = get_free(d)?;
        p.set_type(PING);
        p.fill(&n.to_be_bytes())?;
        send(d, p, 1)?;

        let reply = wait_recv(d)?;
        if reply.pkt_type() != PONG || reply.data() != n.to_be_bytes() {
            bail!("bad reply to ping {n}: type {}", reply.pkt_type());
        }
        d.free_put(reply)?;
    }

    let mut bye = get_free(d)?;
    bye.set_type(BYE);
    bye.fill(b"bye")?;
    match d.send(bye, Dest::Broadcast) {
        Ok(()) => Ok(()),
        Err(e) if e.error == SmPktError::IncompleteBroadcast => {
            eprintln!("cpu {}: goodbye did not reach everyone", d.cpu());
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn pong(d: &mut SmPktDesc<Host>) -> Result<()> {
    loop {
        let mut p = wait_recv(d)?;
        match p.pkt_type() {
            PING => {
                p.set_type(PONG);
                let from = p.src_cpu();
                send(d, p, from)?;
            }
            BYE => {
                d.free_put(p)?;
                return Ok(());
            }
            other => bail!("unexpected packet type {other}"),
        }
    }
}

fn listen(d: &mut SmPktDesc<Host>) -> Result<()> {
    let p = wait_recv(d)?;
    if p.pkt_type() != BYE {
        bail!("unexpected packet type {}", p.pkt_type());
    }
    d.free_put(p)?;
    Ok(())
}

fn node(
    mem: SmMem,
    host: Host,
    base: PktConfig,
    cpu: u16,
    rounds: u32,
    ready: &Barrier,
) -> Result<SmPktDesc<Host>> {
    host.register(cpu);
    let cfg = PktConfig {
        cpu,
        notify: NotifyMethod {
            kind: NotifyKind::User1,
            args: [u32::from(cpu), 0, 0],
        },
        ..base
    };
    let mut d = SmPktDesc::init(mem, host.clone(), cfg);
    let attached = d.attach().with_context(|| format!("cpu {cpu} attach"));
    // Everyone must be attached before the first send, and nobody may be
    // left waiting at the barrier if someone else failed.
    if attached.is_err() {
        host.fail();
    }
    ready.wait();
    attached?;

    let ran = match cpu {
        MASTER_CPU => ping(&mut d, rounds),
        1 => pong(&mut d),
        _ => listen(&mut d),
    };
    if let Err(e) = ran {
        host.fail();
        return Err(e.context(format!("cpu {cpu}")));
    }
    Ok(d)
}

/// Formats a region for `setup.max_cpus` CPUs in `window`, after room for
/// the anchor.
///
/// # Safety
///
/// `window` must outlive every use of the returned `SmMem`.
unsafe fn format(
    window: &mut [u64],
    setup: &SetupConfig,
) -> Result<(SmMem, Host)> {
    let len = std::mem::size_of_val(window);
    let mem = unsafe { SmMem::from_raw(window.as_mut_ptr().cast(), len)? };
    let host = Host::new(setup.max_cpus);
    smpkt::setup(
        &mem,
        &host,
        mem.base().as_ptr().wrapping_add(REGION_AT),
        len - REGION_AT,
        setup,
    )
    .context("formatting region")?;
    Ok((mem, host))
}

fn main() -> Result<()> {
    let args = Args::parse();
    let mut board: Board = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?
        }
        None => Board::default(),
    };
    if args.cpus < 2 {
        bail!("need at least two CPUs");
    }
    board.setup.max_cpus = args.cpus;

    let region_len = args.region_kib * 1024;
    let mut window = vec![0u64; (REGION_AT + region_len).div_ceil(8)];
    // Safety: `window` outlives every thread below, since they are all
    // scoped, and is only ever touched through `mem`.
    let (mem, host) = unsafe { format(&mut window, &board.setup)? };

    let stop = AtomicBool::new(false);
    let ready = Barrier::new(usize::from(args.cpus));
    let beat_every = Duration::from_millis(board.node.ticks_per_beat.into());

    let nodes = thread::scope(|s| {
        s.spawn(|| {
            while !stop.load(Ordering::Relaxed) {
                smpkt::beat(&mem);
                thread::sleep(beat_every);
            }
        });

        let handles: Vec<_> = (0..args.cpus)
            .map(|cpu| {
                let host = host.clone();
                let (ready, base) = (&ready, board.node);
                s.spawn(move || node(mem, host, base, cpu, args.rounds, ready))
            })
            .collect();
        let nodes: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|_| Err(anyhow!("node panicked"))))
            .collect();
        stop.store(true, Ordering::Relaxed);
        nodes
    });
    let mut nodes = nodes.into_iter().collect::<Result<Vec<_>>>()?;

    let master = &nodes[0];
    println!("{}", master.region_info()?);
    for cpu in 0..args.cpus {
        let info = master.cpu_info(CpuSel::Cpu(cpu))?;
        let rung = host.rung[usize::from(cpu)].load(Ordering::Relaxed);
        println!("{info}  rung {rung}");
    }

    for d in nodes.iter_mut().rev() {
        d.detach(true)?;
    }
    drop(window);
    Ok(())
}
