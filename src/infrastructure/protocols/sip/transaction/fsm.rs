//! Transaction state machines (RFC 3261 Section 17, RFC 6026 Accepted state)
//!
//! Each state variant owns the timers that belong to it. Leaving a state drops
//! the variant, and dropping a [`Timer`] aborts it, so a timer can never fire
//! into a state that did not start it. Timer events that still race in are
//! matched by id against the current state and ignored when stale.

use crate::infrastructure::protocols::sip::builder::{build_ack, synthesize_response};
use crate::infrastructure::protocols::sip::message::{SipError, SipMessage, SipMethod, SipRequest, SipResponse};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// SIP Timers (RFC 3261 Section 17.1.1.1)
#[derive(Debug, Clone, Copy)]
pub struct SipTimers {
    /// T1: RTT Estimate (default 500ms)
    pub t1: Duration,
    /// T2: Maximum retransmit interval for non-INVITE requests (default 4s)
    pub t2: Duration,
    /// T4: Maximum duration a message remains in network (default 5s)
    pub t4: Duration,
    /// Give up on an unanswered ringing INVITE after this long; zero disables
    pub ring_time_limit: Duration,
}

impl SipTimers {
    /// 64*T1, the transaction timeout
    pub fn timeout(&self) -> Duration {
        self.t1 * 64
    }
}

impl Default for SipTimers {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
            ring_time_limit: Duration::from_millis(600_000),
        }
    }
}

/// Timer types for SIP transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerType {
    /// Timer A: INVITE request retransmit, starts at T1 and doubles
    TimerA,
    /// Timer B: INVITE transaction timeout (64*T1)
    TimerB,
    /// Timer C: ring time limit while Proceeding
    TimerC,
    /// Timer D: Completed ICT absorbs response retransmits (64*T1)
    TimerD,
    /// Timer E: Non-INVITE request retransmit, doubles up to T2
    TimerE,
    /// Timer F: Non-INVITE transaction timeout (64*T1)
    TimerF,
    /// Timer G: INVITE final response retransmit, starts at T1 and doubles
    TimerG,
    /// Timer H: Wait time for ACK receipt (64*T1)
    TimerH,
    /// Timer I: Confirmed IST absorbs ACK retransmits (T4)
    TimerI,
    /// Timer J: Completed NIST absorbs request retransmits (64*T1)
    TimerJ,
    /// Timer K: Completed NICT absorbs response retransmits (T4)
    TimerK,
    /// Timer L: Accepted IST lifetime (64*T1)
    TimerL,
    /// Timer M: Accepted ICT lifetime (64*T1)
    TimerM,
}

/// A scheduled timer. Dropping it cancels it.
#[derive(Debug)]
pub struct Timer {
    id: u64,
    timer_type: TimerType,
    handle: Option<JoinHandle<()>>,
}

impl Timer {
    pub fn new(id: u64, timer_type: TimerType, handle: Option<JoinHandle<()>>) -> Self {
        Self { id, timer_type, handle }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn timer_type(&self) -> TimerType {
        self.timer_type
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Starts timers on behalf of a state machine
pub trait Scheduler {
    fn schedule(&mut self, timer_type: TimerType, after: Duration) -> Timer;
}

/// Side effect requested by a state machine
#[derive(Debug, Clone)]
pub enum Action {
    /// Put a message on the wire
    Send(SipMessage),
    /// Hand a message to the transaction user
    Deliver(SipMessage),
}

fn owns(timer: &Option<Timer>, id: u64) -> bool {
    timer.as_ref().map_or(false, |t| t.id == id)
}

fn invalid_state(kind: &str, state: &str) -> SipError {
    SipError::TransactionError(format!("{} cannot respond in state {}", kind, state))
}

// ---------------------------------------------------------------------------
// INVITE server transaction

enum IstState {
    Proceeding { last: Option<SipResponse> },
    Accepted { last: SipResponse, timer_l: Timer },
    Completed { last: SipResponse, interval: Duration, timer_g: Option<Timer>, timer_h: Timer },
    Confirmed { timer_i: Timer },
    Terminated,
}

/// INVITE Server Transaction (RFC 3261 Section 17.2.1)
pub struct InviteServer {
    state: IstState,
    timers: SipTimers,
    reliable: bool,
}

impl InviteServer {
    pub fn new(timers: SipTimers, reliable: bool) -> Self {
        Self {
            state: IstState::Proceeding { last: None },
            timers,
            reliable,
        }
    }

    pub fn state(&self) -> &'static str {
        match self.state {
            IstState::Proceeding { .. } => "Proceeding",
            IstState::Accepted { .. } => "Accepted",
            IstState::Completed { .. } => "Completed",
            IstState::Confirmed { .. } => "Confirmed",
            IstState::Terminated => "Terminated",
        }
    }

    pub fn respond(&mut self, response: SipResponse, scheduler: &mut dyn Scheduler) -> Result<Vec<Action>, SipError> {
        let send = Action::Send(SipMessage::Response(response.clone()));
        let state = std::mem::replace(&mut self.state, IstState::Terminated);

        self.state = match state {
            IstState::Proceeding { .. } if response.is_provisional() => IstState::Proceeding { last: Some(response) },
            IstState::Proceeding { .. } if response.is_success() => IstState::Accepted {
                last: response,
                timer_l: scheduler.schedule(TimerType::TimerL, self.timers.timeout()),
            },
            IstState::Proceeding { .. } => IstState::Completed {
                last: response,
                interval: self.timers.t1,
                timer_g: (!self.reliable).then(|| scheduler.schedule(TimerType::TimerG, self.timers.t1)),
                timer_h: scheduler.schedule(TimerType::TimerH, self.timers.timeout()),
            },
            IstState::Accepted { timer_l, .. } if response.is_success() => IstState::Accepted { last: response, timer_l },
            other => {
                self.state = other;
                return Err(invalid_state("IST", self.state()));
            }
        };
        Ok(vec![send])
    }

    pub fn on_message(&mut self, message: &SipMessage, scheduler: &mut dyn Scheduler) -> Vec<Action> {
        let SipMessage::Request(request) = message else {
            return Vec::new();
        };

        if request.method == SipMethod::Ack {
            match self.state {
                IstState::Completed { .. } => {
                    self.state = IstState::Confirmed {
                        timer_i: scheduler.schedule(TimerType::TimerI, self.timers.t4),
                    };
                    Vec::new()
                }
                IstState::Accepted { .. } => vec![Action::Deliver(message.clone())],
                _ => Vec::new(),
            }
        } else {
            // retransmitted INVITE
            match &self.state {
                IstState::Proceeding { last: Some(last) }
                | IstState::Accepted { last, .. }
                | IstState::Completed { last, .. } => vec![Action::Send(SipMessage::Response(last.clone()))],
                _ => Vec::new(),
            }
        }
    }

    pub fn on_timer(&mut self, id: u64, scheduler: &mut dyn Scheduler) -> Vec<Action> {
        match &mut self.state {
            IstState::Completed { last, interval, timer_g, .. } if owns(timer_g, id) => {
                *interval *= 2;
                *timer_g = Some(scheduler.schedule(TimerType::TimerG, *interval));
                vec![Action::Send(SipMessage::Response(last.clone()))]
            }
            IstState::Completed { timer_h, .. } if timer_h.id == id => {
                debug!("IST: no ACK within Timer H");
                self.state = IstState::Terminated;
                Vec::new()
            }
            IstState::Accepted { timer_l, .. } if timer_l.id == id => {
                self.state = IstState::Terminated;
                Vec::new()
            }
            IstState::Confirmed { timer_i } if timer_i.id == id => {
                self.state = IstState::Terminated;
                Vec::new()
            }
            _ => Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Non-INVITE server transaction

enum NistState {
    Trying { last: Option<SipResponse> },
    Completed { last: SipResponse, timer_j: Timer },
    Terminated,
}

/// Non-INVITE Server Transaction (RFC 3261 Section 17.2.2)
pub struct NonInviteServer {
    state: NistState,
    timers: SipTimers,
}

impl NonInviteServer {
    pub fn new(timers: SipTimers) -> Self {
        Self {
            state: NistState::Trying { last: None },
            timers,
        }
    }

    pub fn state(&self) -> &'static str {
        match self.state {
            NistState::Trying { last: None } => "Trying",
            NistState::Trying { last: Some(_) } => "Proceeding",
            NistState::Completed { .. } => "Completed",
            NistState::Terminated => "Terminated",
        }
    }

    pub fn respond(&mut self, response: SipResponse, scheduler: &mut dyn Scheduler) -> Result<Vec<Action>, SipError> {
        if !matches!(self.state, NistState::Trying { .. }) {
            return Err(invalid_state("NIST", self.state()));
        }
        let send = Action::Send(SipMessage::Response(response.clone()));
        self.state = if response.is_provisional() {
            NistState::Trying { last: Some(response) }
        } else {
            NistState::Completed {
                last: response,
                timer_j: scheduler.schedule(TimerType::TimerJ, self.timers.timeout()),
            }
        };
        Ok(vec![send])
    }

    pub fn on_message(&mut self, message: &SipMessage) -> Vec<Action> {
        if !message.is_request() {
            return Vec::new();
        }
        match &self.state {
            NistState::Trying { last: Some(last) } | NistState::Completed { last, .. } => {
                vec![Action::Send(SipMessage::Response(last.clone()))]
            }
            _ => Vec::new(),
        }
    }

    pub fn on_timer(&mut self, id: u64) -> Vec<Action> {
        if let NistState::Completed { timer_j, .. } = &self.state {
            if timer_j.id == id {
                self.state = NistState::Terminated;
            }
        }
        Vec::new()
    }
}

// ---------------------------------------------------------------------------
// INVITE client transaction

enum IctState {
    Calling { request: SipRequest, interval: Duration, timer_a: Option<Timer>, timer_b: Timer },
    Proceeding { request: SipRequest, timer_c: Option<Timer> },
    Accepted { timer_m: Timer },
    Completed { ack: SipRequest, timer_d: Timer },
    Terminated,
}

/// INVITE Client Transaction (RFC 3261 Section 17.1.1)
pub struct InviteClient {
    state: IctState,
    timers: SipTimers,
}

impl InviteClient {
    /// Enter Calling and emit the INVITE
    pub fn start(
        request: SipRequest,
        timers: SipTimers,
        reliable: bool,
        scheduler: &mut dyn Scheduler,
    ) -> (Self, Vec<Action>) {
        let send = Action::Send(SipMessage::Request(request.clone()));
        let state = IctState::Calling {
            request,
            interval: timers.t1,
            timer_a: (!reliable).then(|| scheduler.schedule(TimerType::TimerA, timers.t1)),
            timer_b: scheduler.schedule(TimerType::TimerB, timers.timeout()),
        };
        (Self { state, timers }, vec![send])
    }

    pub fn state(&self) -> &'static str {
        match self.state {
            IctState::Calling { .. } => "Calling",
            IctState::Proceeding { .. } => "Proceeding",
            IctState::Accepted { .. } => "Accepted",
            IctState::Completed { .. } => "Completed",
            IctState::Terminated => "Terminated",
        }
    }

    pub fn on_message(&mut self, message: &SipMessage, scheduler: &mut dyn Scheduler) -> Vec<Action> {
        let SipMessage::Response(response) = message else {
            return Vec::new();
        };
        let deliver = Action::Deliver(message.clone());
        let state = std::mem::replace(&mut self.state, IctState::Terminated);

        let (state, actions) = match state {
            IctState::Calling { request, .. } | IctState::Proceeding { request, timer_c: None }
                if response.is_provisional() =>
            {
                let ring = self.timers.ring_time_limit;
                let timer_c = (!ring.is_zero()).then(|| scheduler.schedule(TimerType::TimerC, ring));
                (IctState::Proceeding { request, timer_c }, vec![deliver])
            }
            IctState::Proceeding { request, timer_c } if response.is_provisional() => {
                (IctState::Proceeding { request, timer_c }, vec![deliver])
            }
            IctState::Calling { .. } | IctState::Proceeding { .. } if response.is_success() => (
                IctState::Accepted {
                    timer_m: scheduler.schedule(TimerType::TimerM, self.timers.timeout()),
                },
                vec![deliver],
            ),
            IctState::Calling { request, .. } | IctState::Proceeding { request, .. } => {
                let ack = build_ack(&request, response);
                let send = Action::Send(SipMessage::Request(ack.clone()));
                (
                    IctState::Completed {
                        ack,
                        timer_d: scheduler.schedule(TimerType::TimerD, self.timers.timeout()),
                    },
                    vec![send, deliver],
                )
            }
            IctState::Accepted { timer_m } => {
                let actions = if response.is_success() { vec![deliver] } else { Vec::new() };
                (IctState::Accepted { timer_m }, actions)
            }
            IctState::Completed { ack, timer_d } => {
                let actions = if response.status >= 300 {
                    vec![Action::Send(SipMessage::Request(ack.clone()))]
                } else {
                    Vec::new()
                };
                (IctState::Completed { ack, timer_d }, actions)
            }
            IctState::Terminated => (IctState::Terminated, Vec::new()),
        };
        self.state = state;
        actions
    }

    pub fn on_timer(&mut self, id: u64, scheduler: &mut dyn Scheduler) -> Vec<Action> {
        match &mut self.state {
            IctState::Calling { request, interval, timer_a, .. } if owns(timer_a, id) => {
                *interval *= 2;
                *timer_a = Some(scheduler.schedule(TimerType::TimerA, *interval));
                vec![Action::Send(SipMessage::Request(request.clone()))]
            }
            IctState::Calling { request, timer_b, .. } if timer_b.id == id => {
                let timeout = synthesize_response(request, 408);
                self.state = IctState::Terminated;
                vec![Action::Deliver(SipMessage::Response(timeout))]
            }
            IctState::Proceeding { request, timer_c } if owns(timer_c, id) => {
                debug!("ICT: ring time limit reached");
                let timeout = synthesize_response(request, 408);
                self.state = IctState::Terminated;
                vec![Action::Deliver(SipMessage::Response(timeout))]
            }
            IctState::Accepted { timer_m } if timer_m.id == id => {
                self.state = IctState::Terminated;
                Vec::new()
            }
            IctState::Completed { timer_d, .. } if timer_d.id == id => {
                self.state = IctState::Terminated;
                Vec::new()
            }
            _ => Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Non-INVITE client transaction

enum NictState {
    Active {
        request: SipRequest,
        proceeding: bool,
        interval: Duration,
        timer_e: Option<Timer>,
        timer_f: Timer,
    },
    Completed { timer_k: Timer },
    Terminated,
}

/// Non-INVITE Client Transaction (RFC 3261 Section 17.1.2)
pub struct NonInviteClient {
    state: NictState,
    timers: SipTimers,
}

impl NonInviteClient {
    /// Enter Trying and emit the request
    pub fn start(
        request: SipRequest,
        timers: SipTimers,
        reliable: bool,
        scheduler: &mut dyn Scheduler,
    ) -> (Self, Vec<Action>) {
        let send = Action::Send(SipMessage::Request(request.clone()));
        let state = NictState::Active {
            request,
            proceeding: false,
            interval: timers.t1,
            timer_e: (!reliable).then(|| scheduler.schedule(TimerType::TimerE, timers.t1)),
            timer_f: scheduler.schedule(TimerType::TimerF, timers.timeout()),
        };
        (Self { state, timers }, vec![send])
    }

    pub fn state(&self) -> &'static str {
        match self.state {
            NictState::Active { proceeding: false, .. } => "Trying",
            NictState::Active { proceeding: true, .. } => "Proceeding",
            NictState::Completed { .. } => "Completed",
            NictState::Terminated => "Terminated",
        }
    }

    pub fn on_message(&mut self, message: &SipMessage, scheduler: &mut dyn Scheduler) -> Vec<Action> {
        let SipMessage::Response(response) = message else {
            return Vec::new();
        };
        match &mut self.state {
            NictState::Active { proceeding, .. } if response.is_provisional() => {
                *proceeding = true;
                vec![Action::Deliver(message.clone())]
            }
            NictState::Active { .. } => {
                self.state = NictState::Completed {
                    timer_k: scheduler.schedule(TimerType::TimerK, self.timers.t4),
                };
                vec![Action::Deliver(message.clone())]
            }
            _ => Vec::new(),
        }
    }

    pub fn on_timer(&mut self, id: u64, scheduler: &mut dyn Scheduler) -> Vec<Action> {
        let t2 = self.timers.t2;
        match &mut self.state {
            NictState::Active { request, proceeding, interval, timer_e, .. } if owns(timer_e, id) => {
                *interval = if *proceeding { t2 } else { (*interval * 2).min(t2) };
                *timer_e = Some(scheduler.schedule(TimerType::TimerE, *interval));
                vec![Action::Send(SipMessage::Request(request.clone()))]
            }
            NictState::Active { request, timer_f, .. } if timer_f.id == id => {
                let timeout = synthesize_response(request, 408);
                self.state = NictState::Terminated;
                vec![Action::Deliver(SipMessage::Response(timeout))]
            }
            NictState::Completed { timer_k } if timer_k.id == id => {
                self.state = NictState::Terminated;
                Vec::new()
            }
            _ => Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------

/// Any of the four transaction machines
pub enum Machine {
    InviteServer(InviteServer),
    NonInviteServer(NonInviteServer),
    InviteClient(InviteClient),
    NonInviteClient(NonInviteClient),
}

impl Machine {
    pub fn kind(&self) -> &'static str {
        match self {
            Machine::InviteServer(_) => "IST",
            Machine::NonInviteServer(_) => "NIST",
            Machine::InviteClient(_) => "ICT",
            Machine::NonInviteClient(_) => "NICT",
        }
    }

    pub fn state(&self) -> &'static str {
        match self {
            Machine::InviteServer(m) => m.state(),
            Machine::NonInviteServer(m) => m.state(),
            Machine::InviteClient(m) => m.state(),
            Machine::NonInviteClient(m) => m.state(),
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == "Terminated"
    }

    /// Message from the wire matched to this transaction
    pub fn on_message(&mut self, message: &SipMessage, scheduler: &mut dyn Scheduler) -> Vec<Action> {
        match self {
            Machine::InviteServer(m) => m.on_message(message, scheduler),
            Machine::NonInviteServer(m) => m.on_message(message),
            Machine::InviteClient(m) => m.on_message(message, scheduler),
            Machine::NonInviteClient(m) => m.on_message(message, scheduler),
        }
    }

    /// Response from the transaction user
    pub fn respond(&mut self, response: SipResponse, scheduler: &mut dyn Scheduler) -> Result<Vec<Action>, SipError> {
        match self {
            Machine::InviteServer(m) => m.respond(response, scheduler),
            Machine::NonInviteServer(m) => m.respond(response, scheduler),
            _ => Err(SipError::TransactionError(format!("{} cannot send responses", self.kind()))),
        }
    }

    pub fn on_timer(&mut self, id: u64, scheduler: &mut dyn Scheduler) -> Vec<Action> {
        match self {
            Machine::InviteServer(m) => m.on_timer(id, scheduler),
            Machine::NonInviteServer(m) => m.on_timer(id),
            Machine::InviteClient(m) => m.on_timer(id, scheduler),
            Machine::NonInviteClient(m) => m.on_timer(id, scheduler),
        }
    }

    /// Force Terminated, cancelling whatever timers the current state holds
    pub fn terminate(&mut self) {
        match self {
            Machine::InviteServer(m) => m.state = IstState::Terminated,
            Machine::NonInviteServer(m) => m.state = NistState::Terminated,
            Machine::InviteClient(m) => m.state = IctState::Terminated,
            Machine::NonInviteClient(m) => m.state = NictState::Terminated,
        }
    }
}
