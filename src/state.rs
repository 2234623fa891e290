//! Device State Machine (§3, §4.1): the `{role, peer_role, conn, disk, pdisk}`
//! tuple, its sanitising pass, preflight checklist, and post-transition
//! actions.

use bitflags::bitflags;
use std::sync::Mutex;

use crate::error::StateError;
use crate::wire::ReaderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Role {
    Unknown = 0,
    Secondary = 1,
    Primary = 2,
}

impl Role {
    pub fn from_u8(v: u8) -> Result<Self, ReaderError> {
        Ok(match v {
            0 => Role::Unknown,
            1 => Role::Secondary,
            2 => Role::Primary,
            _ => return Err(ReaderError::InvalidValue),
        })
    }
}

/// Declaration order is significant: `conn < Connected`/`conn > Connected`
/// comparisons in §3's invariants rely on this ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Conn {
    StandAlone = 0,
    Unconnected = 1,
    WFConnection = 2,
    WFReportParams = 3,
    Connected = 4,
    WFBitMapS = 5,
    WFBitMapT = 6,
    SyncSource = 7,
    SyncTarget = 8,
    PausedSyncS = 9,
    PausedSyncT = 10,
    SkippedSyncS = 11,
    SkippedSyncT = 12,
    Timeout = 13,
    BrokenPipe = 14,
}

impl Conn {
    pub fn from_u8(v: u8) -> Result<Self, ReaderError> {
        use Conn::*;
        Ok(match v {
            0 => StandAlone,
            1 => Unconnected,
            2 => WFConnection,
            3 => WFReportParams,
            4 => Connected,
            5 => WFBitMapS,
            6 => WFBitMapT,
            7 => SyncSource,
            8 => SyncTarget,
            9 => PausedSyncS,
            10 => PausedSyncT,
            11 => SkippedSyncS,
            12 => SkippedSyncT,
            13 => Timeout,
            14 => BrokenPipe,
            _ => return Err(ReaderError::InvalidValue),
        })
    }

    pub fn is_resync(self) -> bool {
        matches!(
            self,
            Conn::SyncSource
                | Conn::SyncTarget
                | Conn::PausedSyncS
                | Conn::PausedSyncT
                | Conn::SkippedSyncS
                | Conn::SkippedSyncT
        )
    }
}

/// Declaration order is significant: `disk <= Failed`/`disk < Consistent`
/// comparisons in §3's invariants rely on this ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Disk {
    Diskless = 0,
    Failed = 1,
    Inconsistent = 2,
    Outdated = 3,
    Consistent = 4,
    UpToDate = 5,
    DUnknown = 6,
}

impl Disk {
    pub fn from_u8(v: u8) -> Result<Self, ReaderError> {
        use Disk::*;
        Ok(match v {
            0 => Diskless,
            1 => Failed,
            2 => Inconsistent,
            3 => Outdated,
            4 => Consistent,
            5 => UpToDate,
            6 => DUnknown,
            _ => return Err(ReaderError::InvalidValue),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceState {
    pub role: Role,
    pub peer_role: Role,
    pub conn: Conn,
    pub disk: Disk,
    pub pdisk: Disk,
}

impl DeviceState {
    pub const INITIAL: DeviceState = DeviceState {
        role: Role::Secondary,
        peer_role: Role::Unknown,
        conn: Conn::StandAlone,
        disk: Disk::Diskless,
        pdisk: Disk::DUnknown,
    };
}

impl Default for DeviceState {
    fn default() -> Self {
        Self::INITIAL
    }
}

bitflags! {
    /// Flags accepted by `propose`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChgStateFlags: u32 {
        /// Bypass the preflight checklist (admin force / handshake apply).
        const HARD = 0b0001;
        /// Log both requested and refused tuples on rejection.
        const VERBOSE = 0b0010;
        /// Caller has independently determined the peer's generation counts
        /// diverge from ours (split brain); only meaningful on a transition
        /// into a connected `conn`.
        const SPLIT_BRAIN_DETECTED = 0b0100;
    }
}

/// Work the caller must schedule after a transition is accepted (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostChangeAction {
    SendSizes,
    SendState,
    PinCore,
    StopResyncTimer,
}

/// Collapse a proposed tuple into one satisfying invariants I1–I3, logging a
/// warning wherever a field is silently rewritten. I4 is checked separately
/// since it is fatal rather than correctable.
fn sanitise(old: DeviceState, mut new: DeviceState) -> DeviceState {
    // I1: conn < Connected implies peer_role unknown and pdisk unknown.
    if new.conn < Conn::Connected {
        if new.peer_role != Role::Unknown {
            if log::log_enabled!(log::Level::Warn) {
                log::warn!("sanitise: forcing peer_role Unknown (conn {:?} < Connected)", new.conn);
            }
            new.peer_role = Role::Unknown;
        }
        if new.pdisk != Disk::DUnknown {
            if log::log_enabled!(log::Level::Warn) {
                log::warn!("sanitise: forcing pdisk DUnknown (conn {:?} < Connected)", new.conn);
            }
            new.pdisk = Disk::DUnknown;
        }
    }

    // I2: conn > Connected with disk <= Failed cannot resync; fall back to
    // Connected ("resync aborted").
    if new.conn > Conn::Connected && new.disk <= Disk::Failed {
        if log::log_enabled!(log::Level::Warn) {
            log::warn!(
                "sanitise: resync aborted, disk {:?} too bad for conn {:?}",
                new.disk,
                new.conn
            );
        }
        new.conn = Conn::Connected;
    }

    // I3: Consistent under a connected conn collapses deterministically by
    // conn's resync role.
    if new.disk == Disk::Consistent && new.conn >= Conn::Connected {
        let collapsed = if matches!(
            new.conn,
            Conn::SyncTarget | Conn::PausedSyncT | Conn::SkippedSyncT
        ) {
            Disk::Inconsistent
        } else {
            Disk::UpToDate
        };
        if log::log_enabled!(log::Level::Warn) {
            log::warn!(
                "sanitise: Implicit {:?} (Consistent under conn {:?})",
                collapsed,
                new.conn
            );
        }
        new.disk = collapsed;
    }

    let _ = old;
    new
}

fn preflight(
    old: DeviceState,
    new: DeviceState,
    two_primaries: bool,
    flags: ChgStateFlags,
) -> Result<(), StateError> {
    if !two_primaries && old.role == Role::Primary && new.peer_role == Role::Primary {
        return Err(StateError::NoTwoPrimaries);
    }
    if new.role == Role::Primary && new.disk < Disk::Consistent {
        return Err(StateError::PrimaryWithoutGoodData);
    }
    if flags.contains(ChgStateFlags::SPLIT_BRAIN_DETECTED)
        && old.conn < Conn::Connected
        && new.conn >= Conn::Connected
    {
        return Err(StateError::SplitBrainRefused);
    }
    if new.role == Role::Primary
        && new.conn >= Conn::Connected
        && new.disk != Disk::UpToDate
        && new.pdisk != Disk::UpToDate
    {
        return Err(StateError::PrimaryNeedsPeerUpToDate);
    }
    if new.conn >= Conn::Connected && new.pdisk == Disk::Diskless {
        return Err(StateError::ConnectedButPeerDiskless);
    }
    if new.role == Role::Primary && new.disk == Disk::Outdated {
        return Err(StateError::OutdatedPrimaryRefused);
    }
    Ok(())
}

fn post_change_actions(old: DeviceState, new: DeviceState) -> Vec<PostChangeAction> {
    let mut actions = Vec::new();
    if old.disk == Disk::Diskless && new.disk >= Disk::Inconsistent && new.conn >= Conn::Connected {
        actions.push(PostChangeAction::SendSizes);
        actions.push(PostChangeAction::SendState);
    }
    if (old.disk == Disk::Diskless && new.disk != Disk::Diskless)
        || (old.peer_role == Role::Unknown && new.conn > Conn::StandAlone)
    {
        actions.push(PostChangeAction::PinCore);
    }
    if old.conn >= Conn::SyncSource && new.conn <= Conn::Connected {
        actions.push(PostChangeAction::StopResyncTimer);
    }
    actions
}

/// A single in-memory tuple protected by a lock (§4.1). `propose`/`force`
/// are synchronous and non-blocking; `tokio::sync::Notify` wakes waiters on
/// `read`'s condition-variable role without needing an async mutex here.
pub struct StateMachine {
    inner: Mutex<DeviceState>,
    notify: tokio::sync::Notify,
    two_primaries: bool,
}

impl StateMachine {
    pub fn new(initial: DeviceState, two_primaries: bool) -> Self {
        Self {
            inner: Mutex::new(initial),
            notify: tokio::sync::Notify::new(),
            two_primaries,
        }
    }

    pub fn read(&self) -> DeviceState {
        *self.inner.lock().unwrap()
    }

    /// Waits until the state changes from `since`.
    pub async fn wait_for_change(&self, since: DeviceState) -> DeviceState {
        loop {
            let current = self.read();
            if current != since {
                return current;
            }
            self.notify.notified().await;
        }
    }

    pub fn propose(
        &self,
        requested: DeviceState,
        flags: ChgStateFlags,
    ) -> Result<(DeviceState, Vec<PostChangeAction>), StateError> {
        let mut guard = self.inner.lock().unwrap();
        let old = *guard;
        let sanitised = sanitise(old, requested);

        // I4: fatal, never correctable.
        if sanitised.role == Role::Primary && sanitised.disk < Disk::Consistent && sanitised.conn < Conn::Connected {
            panic!(
                "FatalInvariant: role=Primary with disk={:?} conn={:?} (no access to good data)",
                sanitised.disk, sanitised.conn
            );
        }

        if !flags.contains(ChgStateFlags::HARD) {
            if let Err(e) = preflight(old, sanitised, self.two_primaries, flags) {
                if flags.contains(ChgStateFlags::VERBOSE) && log::log_enabled!(log::Level::Warn) {
                    log::warn!("state change refused ({e}): requested {requested:?}, current {old:?}");
                }
                return Err(e);
            }
        }

        *guard = sanitised;
        drop(guard);
        self.notify.notify_waiters();
        Ok((sanitised, post_change_actions(old, sanitised)))
    }

    pub fn force(&self, requested: DeviceState) -> (DeviceState, Vec<PostChangeAction>) {
        self.propose(requested, ChgStateFlags::HARD)
            .expect("force() bypasses preflight and cannot be refused")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected_up_to_date() -> DeviceState {
        DeviceState {
            role: Role::Primary,
            peer_role: Role::Secondary,
            conn: Conn::Connected,
            disk: Disk::UpToDate,
            pdisk: Disk::UpToDate,
        }
    }

    #[test]
    fn sanitiser_is_idempotent() {
        let cases = [
            DeviceState::INITIAL,
            connected_up_to_date(),
            DeviceState {
                role: Role::Secondary,
                peer_role: Role::Secondary,
                conn: Conn::SyncTarget,
                disk: Disk::Consistent,
                pdisk: Disk::UpToDate,
            },
        ];
        for case in cases {
            let once = sanitise(case, case);
            let twice = sanitise(once, once);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn scenario_3_preflight_refuses_dual_primary() {
        let sm = StateMachine::new(connected_up_to_date(), false);
        let proposed = DeviceState {
            peer_role: Role::Primary,
            ..connected_up_to_date()
        };
        let before = sm.read();
        let err = sm.propose(proposed, ChgStateFlags::empty()).unwrap_err();
        assert_eq!(err, StateError::NoTwoPrimaries);
        assert_eq!(sm.read(), before);
    }

    #[test]
    fn scenario_4_sanitiser_collapses_consistent_under_synctarget() {
        let requested = DeviceState {
            role: Role::Secondary,
            peer_role: Role::Primary,
            conn: Conn::SyncTarget,
            disk: Disk::Consistent,
            pdisk: Disk::UpToDate,
        };
        let got = sanitise(DeviceState::INITIAL, requested);
        assert_eq!(got.disk, Disk::Inconsistent);
    }

    #[test]
    fn no_primary_without_data_invariant_holds() {
        let sm = StateMachine::new(DeviceState::INITIAL, false);
        let requested = DeviceState {
            role: Role::Primary,
            peer_role: Role::Unknown,
            conn: Conn::StandAlone,
            disk: Disk::Inconsistent,
            pdisk: Disk::DUnknown,
        };
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            sm.propose(requested, ChgStateFlags::empty())
        }));
        assert!(result.is_err(), "expected a FatalInvariant panic");
    }

    #[test]
    fn hard_flag_bypasses_preflight() {
        let sm = StateMachine::new(connected_up_to_date(), false);
        let proposed = DeviceState {
            peer_role: Role::Primary,
            ..connected_up_to_date()
        };
        let (applied, _) = sm.force(proposed);
        assert_eq!(applied.peer_role, Role::Primary);
    }
}
