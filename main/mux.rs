//! The Multiplexor Loop (spec §4.E): the heart of the daemon. Builds the
//! interest set each tick, waits, dispatches readiness, accepts clients,
//! reaps dead objects.
//!
//! Grounded on spec §9's arena model (objects keyed by a stable id,
//! `slab::Slab` standing in for "arena of objects keyed by a stable
//! identifier") and on the single-wait event-queue idea used to resolve
//! timer callbacks without fighting the borrow checker: `tpoll`'s timer
//! callbacks cannot hold `&mut Multiplexor` (the loop itself holds it
//! while driving `tpoll::wait`), so each callback instead pushes a plain
//! `TimerEvent` onto a shared `Rc<RefCell<VecDeque<_>>>`, which the loop
//! drains right after `run_expired_timers()`. This is still
//! single-threaded, lock-free bookkeeping (spec §5), just deferred by one
//! step.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::os::unix::io::{BorrowedFd, IntoRawFd, RawFd};
use std::rc::Rc;

use crossbeam::channel::{self, Receiver, Sender};
use log::{debug, info};
use logger::notice;
use nix::sys::socket::{self, AddressFamily, SockFlag, SockType};

use crate::aux;
use crate::client::{self, ConsoleMode, HandshakeOutcome};
use crate::config::ServerConfig;
use crate::error::{MuxError, MuxResult, Verdict};
use crate::engine;
use crate::object::{Aux as ObjAux, ClientAux, ListenerAux, LogfileAux, Object, ObjectFlags, ObjectId, SerialAux, TelnetAux, TelnetState};
use crate::opener;
use crate::signals::{self, SignalPipe};

const TICK_CAP_MS: u64 = 1000;

#[derive(Debug, Clone, Copy)]
enum TimerEvent {
    ReconnectTelnet(ObjectId),
    Timestamp,
    ResetWatchdog(ObjectId),
}

type EventQueue = Rc<RefCell<VecDeque<TimerEvent>>>;

pub struct Multiplexor {
    objects: slab::Slab<Object>,
    tp: tpoll::Tpoll,
    listener_id: ObjectId,
    signal_pipe: SignalPipe,
    config: ServerConfig,
    events: EventQueue,
    hs_tx: Sender<HandshakeOutcome>,
    hs_rx: Receiver<HandshakeOutcome>,
    hs_notify_read: RawFd,
    hs_notify_write: RawFd,
}

impl Multiplexor {
    pub fn build(config: ServerConfig) -> MuxResult<Self> {
        let mut tp = tpoll::Tpoll::new()?;
        let mut objects = slab::Slab::new();

        let listener_fd = bind_listener(config.port, config.enable_loop_back)?;
        let listener_id = objects.insert(Object::new(
            0,
            "listener",
            listener_fd,
            1,
            ObjAux::Listener(ListenerAux { port: config.port, loopback_only: config.enable_loop_back }),
        ));
        // Slab assigns keys lazily; reinsert with the id it actually got
        // recorded against, since `Object::new` above was built before we
        // knew the key.
        objects[listener_id].id = listener_id;

        let (hs_tx, hs_rx) = channel::unbounded();
        let (hs_notify_read, hs_notify_write) = nix::unistd::pipe()?;
        let hs_notify_read = hs_notify_read.into_raw_fd();
        let hs_notify_write = hs_notify_write.into_raw_fd();
        nix::fcntl::fcntl(
            hs_notify_read,
            nix::fcntl::FcntlArg::F_SETFL(nix::fcntl::OFlag::O_NONBLOCK),
        )?;

        let signal_pipe = SignalPipe::install().map_err(MuxError::Errno)?;

        let mut mux = Multiplexor {
            objects,
            tp,
            listener_id,
            signal_pipe,
            config,
            events: Rc::new(RefCell::new(VecDeque::new())),
            hs_tx,
            hs_rx,
            hs_notify_read,
            hs_notify_write,
        };

        mux.build_console_objects()?;

        if mux.config.t_stamp_minutes > 0 {
            mux.arm_timestamp_timer();
        }

        Ok(mux)
    }

    fn build_console_objects(&mut self) -> MuxResult<()> {
        let consoles = self.config.consoles.clone();
        for console in &consoles {
            let buf_capacity = console.buffer_bytes;
            let console_id = match &console.source {
                crate::config::ConsoleSource::Serial { device, baud } => {
                    let (fd, termios) = opener::open_serial(device, *baud)?;
                    self.objects.insert(Object::new(
                        0,
                        console.name.clone(),
                        fd,
                        buf_capacity,
                        ObjAux::Serial(SerialAux { device_path: device.clone(), saved_termios: Some(termios) }),
                    ))
                }
                crate::config::ConsoleSource::Telnet { host, port } => {
                    // A refused/unresolvable connect at startup is a
                    // per-object transient (spec §7), not fatal: the
                    // object comes up Down with fd=-1 and a reconnect
                    // timer already ticking (spec §3.2).
                    let (fd, state) = match opener::connect_telnet(host, *port) {
                        Ok(fd) => (fd, TelnetState::Pending),
                        Err(_) => (-1, TelnetState::Down),
                    };
                    let telnet_id = self.objects.insert(Object::new(
                        0,
                        console.name.clone(),
                        fd,
                        buf_capacity,
                        ObjAux::Telnet(TelnetAux {
                            host: host.clone(),
                            port: *port,
                            state,
                            reconnect_timer: None,
                            backoff_step: 0,
                            parser: crate::telnet::new_parser(),
                        }),
                    ));
                    if state == TelnetState::Down {
                        self.objects[telnet_id].id = telnet_id;
                        self.schedule_reconnect(telnet_id);
                    }
                    telnet_id
                }
            };
            self.objects[console_id].id = console_id;

            if let Some(template) = &console.logfile {
                let path = opener::logfile_path(template, &console.name);
                let fd = opener::open_logfile(&path, self.config.enable_zero_logs)?;
                let log_id = self.objects.insert(Object::new(
                    0,
                    format!("{}-log", console.name),
                    fd,
                    4096,
                    ObjAux::Logfile(LogfileAux { console: console_id, path, truncate_once: self.config.enable_zero_logs }),
                ));
                self.objects[log_id].id = log_id;
                link(&mut self.objects, console_id, log_id);
            }
        }
        Ok(())
    }

    fn arm_timestamp_timer(&mut self) {
        let deadline = aux::first_timestamp_deadline(self.config.t_stamp_minutes);
        let events = self.events.clone();
        self.tp.timer_absolute(deadline, move || {
            events.borrow_mut().push_back(TimerEvent::Timestamp);
        });
    }

    fn schedule_reconnect(&mut self, telnet_id: ObjectId) {
        let step = match &self.objects[telnet_id].aux {
            ObjAux::Telnet(t) => t.backoff_step,
            _ => return,
        };
        let delay = opener::backoff_delay(step);
        let events = self.events.clone();
        let timer_id = self.tp.timer_relative(delay, move || {
            events.borrow_mut().push_back(TimerEvent::ReconnectTelnet(telnet_id));
        });
        if let ObjAux::Telnet(t) = &mut self.objects[telnet_id].aux {
            t.reconnect_timer = Some(timer_id);
            t.backoff_step = t.backoff_step.saturating_add(1);
        }
    }

    fn retry_telnet_connect(&mut self, telnet_id: ObjectId) {
        let Some(obj) = self.objects.get_mut(telnet_id) else { return };
        let (host, port) = match &obj.aux {
            ObjAux::Telnet(t) => (t.host.clone(), t.port),
            _ => return,
        };
        match opener::connect_telnet(&host, port) {
            Ok(fd) => {
                obj.fd = fd;
                if let ObjAux::Telnet(t) = &mut obj.aux {
                    t.state = TelnetState::Pending;
                }
            }
            Err(_) => {
                self.schedule_reconnect(telnet_id);
            }
        }
    }

    /// Run the loop until `done` is set. Returns once shutdown is
    /// orderly complete (spec §4.E step 8, §5 cancellation).
    pub fn run(&mut self) -> MuxResult<()> {
        loop {
            if signals::take_reconfig() {
                self.do_reconfig();
            }

            self.tp.zero_fds();
            self.tp.set(self.objects[self.listener_id].fd, tpoll::Interest::READABLE);
            self.tp.set(self.hs_notify_read, tpoll::Interest::READABLE);
            self.tp.set(self.signal_pipe.read_fd, tpoll::Interest::READABLE);

            let object_ids: Vec<ObjectId> = self.objects.iter().map(|(id, _)| id).collect();
            for id in &object_ids {
                let reset_cmd = {
                    let obj = &self.objects[*id];
                    if obj.flags.contains(ObjectFlags::GOT_RESET) {
                        self.reset_cmd_for(*id)
                    } else {
                        None
                    }
                };
                if let Some(cmd) = reset_cmd {
                    self.fire_reset(*id, &cmd);
                }

                let obj = &self.objects[*id];
                if !obj.is_polled() {
                    continue;
                }

                let is_telnet_pending = matches!(obj.telnet_state(), Some(TelnetState::Pending));
                if is_telnet_pending {
                    self.tp.set(obj.fd, tpoll::Interest::READABLE | tpoll::Interest::WRITABLE);
                    continue;
                }

                let readable = matches!(obj.aux, ObjAux::Serial(_) | ObjAux::Client(_))
                    || matches!(obj.telnet_state(), Some(TelnetState::Up));
                if readable {
                    self.tp.set(obj.fd, tpoll::Interest::READABLE);
                }

                let writable = (!obj.output.is_empty() || obj.flags.contains(ObjectFlags::GOT_EOF))
                    && !obj.is_suspended_client();
                if writable {
                    self.tp.set(obj.fd, tpoll::Interest::WRITABLE);
                }
            }

            let wait_result = self.tp.wait(TICK_CAP_MS);
            match wait_result {
                Err(tpoll::TpollError::Interrupted) => continue,
                Err(e) => return Err(e.into()),
                Ok(_) => {}
            }

            self.tp.run_expired_timers();
            self.drain_timer_events();

            if self.tp.is_set(self.signal_pipe.read_fd, tpoll::Interest::READABLE) {
                self.signal_pipe.drain();
            }
            signals::reap_children();

            if self.tp.is_set(self.hs_notify_read, tpoll::Interest::READABLE) {
                self.drain_handshake_notify();
                self.apply_handshake_outcomes();
            }

            let listener_fd = self.objects[self.listener_id].fd;
            if self.tp.is_set(listener_fd, tpoll::Interest::READABLE) {
                self.accept_clients();
            }

            for id in &object_ids {
                if !self.objects.contains(*id) {
                    continue;
                }
                let obj = &self.objects[*id];
                if !obj.is_polled() {
                    continue;
                }
                let fd = obj.fd;

                if matches!(obj.telnet_state(), Some(TelnetState::Pending))
                    && self.tp.is_set(fd, tpoll::Interest::READABLE | tpoll::Interest::WRITABLE)
                {
                    self.advance_telnet_connect(*id);
                    continue;
                }

                if self.tp.is_set(fd, tpoll::Interest::READABLE) {
                    let verdict = engine::read_from_obj(*id, &mut self.objects);
                    if !self.apply_verdict(*id, verdict) {
                        continue;
                    }
                }

                if self.objects.contains(*id) && self.tp.is_set(fd, tpoll::Interest::WRITABLE) {
                    let verdict = engine::write_to_obj(*id, &mut self.objects);
                    self.apply_verdict(*id, verdict);
                }
            }

            if signals::is_done() {
                break;
            }
        }

        self.shutdown();
        Ok(())
    }

    fn reset_cmd_for(&self, console_id: ObjectId) -> Option<String> {
        self.config
            .consoles
            .iter()
            .find(|c| self.objects.get(console_id).map(|o| o.name == c.name).unwrap_or(false))
            .and_then(|c| c.reset_cmd.clone())
            .or_else(|| self.config.reset_cmd.clone())
    }

    fn fire_reset(&mut self, console_id: ObjectId, cmd: &str) {
        if let Some(process_id) = aux::trigger_reset(&mut self.objects, console_id, cmd) {
            let events = self.events.clone();
            let timer_id = self.tp.timer_relative(aux::RESET_CMD_TIMEOUT, move || {
                events.borrow_mut().push_back(TimerEvent::ResetWatchdog(process_id));
            });
            if let ObjAux::Process(p) = &mut self.objects[process_id].aux {
                p.watchdog_timer = Some(timer_id);
            }
        }
    }

    fn drain_timer_events(&mut self) {
        loop {
            let event = self.events.borrow_mut().pop_front();
            let Some(event) = event else { break };
            match event {
                TimerEvent::Timestamp => {
                    self.fire_timestamps();
                    self.arm_timestamp_timer();
                }
                TimerEvent::ReconnectTelnet(id) => {
                    if self.objects.contains(id) {
                        self.retry_telnet_connect(id);
                    }
                }
                TimerEvent::ResetWatchdog(process_id) => {
                    if let Some(obj) = self.objects.get(process_id) {
                        if let ObjAux::Process(p) = &obj.aux {
                            aux::kill_reset_group(p.pid);
                        }
                        self.objects.remove(process_id);
                    }
                }
            }
        }
    }

    fn fire_timestamps(&mut self) {
        let logs: Vec<(ObjectId, String)> = self
            .objects
            .iter()
            .filter_map(|(id, o)| match &o.aux {
                ObjAux::Logfile(l) => self.objects.get(l.console).map(|c| (id, c.name.clone())),
                _ => None,
            })
            .collect();
        for (log_id, console_name) in logs {
            let line = aux::timestamp_line(&console_name);
            if let Some(obj) = self.objects.get_mut(log_id) {
                obj.output.enqueue(line.as_bytes());
            }
        }
    }

    fn advance_telnet_connect(&mut self, telnet_id: ObjectId) {
        let fd = self.objects[telnet_id].fd;
        let success = opener::poll_connect_result(fd).unwrap_or(false);
        if success {
            if let ObjAux::Telnet(t) = &mut self.objects[telnet_id].aux {
                t.state = TelnetState::Up;
                t.backoff_step = 0;
            }
            info!("telnet console '{}' is up", self.objects[telnet_id].name);
        } else {
            let _ = nix::unistd::close(fd);
            self.objects[telnet_id].fd = -1;
            if let ObjAux::Telnet(t) = &mut self.objects[telnet_id].aux {
                t.state = TelnetState::Down;
            }
            self.schedule_reconnect(telnet_id);
        }
    }

    /// Apply a read/write verdict. Returns `false` if the object was
    /// removed (caller must stop touching it this tick).
    fn apply_verdict(&mut self, id: ObjectId, verdict: Verdict) -> bool {
        match verdict {
            Verdict::Ok => true,
            Verdict::Dispose => {
                self.dispose_object(id);
                false
            }
            Verdict::Reconnect => {
                let fd = self.objects[id].fd;
                if fd >= 0 {
                    let _ = nix::unistd::close(fd);
                }
                self.objects[id].fd = -1;
                self.schedule_reconnect(id);
                true
            }
        }
    }

    fn dispose_object(&mut self, id: ObjectId) {
        notice!("destroying object '{}'", self.objects[id].name);
        if let ObjAux::Serial(s) = &self.objects[id].aux {
            if let Some(termios) = &s.saved_termios {
                opener::restore_serial(self.objects[id].fd, termios);
            }
        }
        let fd = self.objects[id].fd;
        if fd >= 0 {
            let _ = nix::unistd::close(fd);
        }
        self.objects.remove(id);
        for (_, obj) in self.objects.iter_mut() {
            obj.detach_peer(id);
        }
    }

    fn do_reconfig(&mut self) {
        info!("reconfig: reopening daemon log and all per-console log files");
        if let Err(e) = logger::reopen_daemon_log() {
            log::error!("failed to reopen daemon log: {e}");
        }
        let logfiles: Vec<ObjectId> = self
            .objects
            .iter()
            .filter(|(_, o)| matches!(o.aux, ObjAux::Logfile(_)))
            .map(|(id, _)| id)
            .collect();
        for id in logfiles {
            let (path, old_fd) = {
                let obj = &self.objects[id];
                let path = match &obj.aux {
                    ObjAux::Logfile(l) => l.path.clone(),
                    _ => continue,
                };
                (path, obj.fd)
            };
            match opener::reopen_logfile(&path) {
                Ok(new_fd) => {
                    if old_fd >= 0 {
                        let _ = nix::unistd::close(old_fd);
                    }
                    self.objects[id].fd = new_fd;
                }
                Err(e) => log::error!("failed to reopen log file {}: {e}", path.display()),
            }
        }
        // Design note (spec §9 "Ambiguity flagged, not guessed"): reconfig
        // does not resurrect downed serial objects nor reset telnet
        // backoff counters. See DESIGN.md for the rationale.
    }

    fn accept_clients(&mut self) {
        loop {
            match nix::sys::socket::accept4(
                self.objects[self.listener_id].fd,
                SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            ) {
                Ok(fd) => {
                    let remote = describe_peer(fd);
                    let tx = self.hs_tx.clone();
                    let notify_write = self.hs_notify_write;
                    std::thread::spawn(move || {
                        client::process_client(fd, remote, tx);
                        let notify_write = unsafe { BorrowedFd::borrow_raw(notify_write) };
                        let _ = nix::unistd::write(notify_write, &[0u8]);
                    });
                }
                Err(nix::errno::Errno::EAGAIN) => break,
                Err(e) => {
                    log::warn!("accept() failed: {e}");
                    break;
                }
            }
        }
    }

    fn drain_handshake_notify(&self) {
        let mut buf = [0u8; 64];
        loop {
            match nix::unistd::read(self.hs_notify_read, &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) if n < buf.len() => break,
                Ok(_) => continue,
            }
        }
    }

    fn apply_handshake_outcomes(&mut self) {
        while let Ok(outcome) = self.hs_rx.try_recv() {
            self.promote_client(outcome);
        }
    }

    fn promote_client(&mut self, outcome: HandshakeOutcome) {
        let Some((console_id, _)) = self
            .objects
            .iter()
            .find(|(_, o)| o.name == outcome.console_name && matches!(o.aux, ObjAux::Serial(_) | ObjAux::Telnet(_)))
            .map(|(id, _)| (id, ()))
        else {
            debug!("client requested unknown console '{}'", outcome.console_name);
            let _ = nix::unistd::close(outcome.sd);
            return;
        };

        if outcome.mode == ConsoleMode::Force {
            self.revoke_read_write_holders(console_id);
        }

        let client_id = self.objects.insert(Object::new(
            0,
            format!("client:{}", outcome.remote_identity),
            outcome.sd,
            8192,
            ObjAux::Client(ClientAux { remote_identity: outcome.remote_identity, consoles: vec![console_id] }),
        ));
        self.objects[client_id].id = client_id;

        link(&mut self.objects, console_id, client_id);
        if matches!(outcome.mode, ConsoleMode::ReadWrite | ConsoleMode::Force) {
            link(&mut self.objects, client_id, console_id);
        }

        info!("client attached to console '{}'", self.objects[console_id].name);
    }

    fn revoke_read_write_holders(&mut self, console_id: ObjectId) {
        let holders: Vec<ObjectId> = self.objects[console_id].reader_peers.clone();
        for holder_id in holders {
            if let Some(holder) = self.objects.get_mut(holder_id) {
                holder.writer_peers.retain(|&id| id != console_id);
            }
        }
    }

    fn shutdown(&mut self) {
        info!("shutting down");
        let ids: Vec<ObjectId> = self.objects.iter().map(|(id, _)| id).collect();
        for id in ids {
            if id == self.listener_id {
                continue;
            }
            if let Some(obj) = self.objects.get(id) {
                if let ObjAux::Serial(s) = &obj.aux {
                    if let Some(termios) = s.saved_termios.clone() {
                        opener::restore_serial(obj.fd, &termios);
                    }
                }
                if obj.fd >= 0 {
                    let _ = nix::unistd::close(obj.fd);
                }
            }
        }
        let listener_fd = self.objects[self.listener_id].fd;
        let _ = nix::unistd::close(listener_fd);
    }
}

fn describe_peer(fd: RawFd) -> String {
    socket::getpeername::<socket::SockaddrIn>(fd)
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

fn link(objects: &mut slab::Slab<Object>, source: ObjectId, sink: ObjectId) {
    objects[source].writer_peers.push(sink);
    objects[sink].reader_peers.push(source);
}

fn bind_listener(port: u16, loopback_only: bool) -> MuxResult<RawFd> {
    let fd = socket::socket(
        AddressFamily::Inet,
        SockType::Stream,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        None,
    )
    .map_err(MuxError::Errno)?;

    socket::setsockopt(fd, socket::sockopt::ReuseAddr, &true).map_err(MuxError::Errno)?;

    let ip = if loopback_only {
        std::net::Ipv4Addr::LOCALHOST
    } else {
        std::net::Ipv4Addr::UNSPECIFIED
    };
    let addr = socket::SockaddrIn::from(std::net::SocketAddrV4::new(ip, port));
    socket::bind(fd, &addr).map_err(|e| MuxError::Bind { port, source: std::io::Error::from(e) })?;
    socket::listen(fd, 128).map_err(|e| MuxError::Bind { port, source: std::io::Error::from(e) })?;

    Ok(fd)
}
