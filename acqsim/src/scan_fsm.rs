/*!
Scan timing state machine of the acquisition engine.

`Idle -> Integrate -> Readout <-> LineDone -> FrameDone -> Idle`, plus
`Error` reachable from every other state. Only listed (state, event) pairs
produce a transition; anything else is rejected so the caller can log it.
*/

use shared::ErrorCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    Integrate { elapsed_ticks: u64 },
    Readout { row: usize, waited_ticks: u64 },
    LineDone { row: usize },
    FrameDone,
    Error(ErrorCode),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanEvent {
    /// Start command or continuous-mode retrigger
    Start,
    /// Configured gate-on (plus settle) time has elapsed
    GateElapsed,
    /// A full row landed in the active bank
    RowCaptured,
    /// Rows remain after the one just completed
    NextRow,
    LastRow,
    /// Frame bookkeeping done, back to waiting for a trigger
    Rearm,
    Fault(ErrorCode),
    /// Explicit clear accepted by the device
    ClearAccepted,
    Stop,
}

impl ScanState {
    /// Apply an event; `None` means the pair is not a valid transition
    pub fn on(self, event: ScanEvent) -> Option<ScanState> {
        use ScanEvent::*;
        use ScanState::*;

        match (self, event) {
            (Error(_), ClearAccepted) => Some(Idle),
            (Error(_), _) => None,
            (_, Fault(code)) => Some(Error(code)),
            (Idle, Start) => Some(Integrate { elapsed_ticks: 0 }),
            (Integrate { .. }, GateElapsed) => Some(Readout {
                row: 0,
                waited_ticks: 0,
            }),
            (Readout { row, .. }, RowCaptured) => Some(LineDone { row }),
            (LineDone { row }, NextRow) => Some(Readout {
                row: row + 1,
                waited_ticks: 0,
            }),
            (LineDone { .. }, LastRow) => Some(FrameDone),
            (FrameDone, Rearm) => Some(Idle),
            (Idle, Stop) => None,
            (_, Stop) => Some(Idle),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ScanState::Idle => "idle",
            ScanState::Integrate { .. } => "integrate",
            ScanState::Readout { .. } => "readout",
            ScanState::LineDone { .. } => "line_done",
            ScanState::FrameDone => "frame_done",
            ScanState::Error(_) => "error",
        }
    }

    /// Between a start and the end of the frame
    pub fn is_scanning(&self) -> bool {
        matches!(
            self,
            ScanState::Integrate { .. } | ScanState::Readout { .. } | ScanState::LineDone { .. } | ScanState::FrameDone
        )
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ScanState::Error(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_cycle() {
        let mut state = ScanState::Idle;
        state = state.on(ScanEvent::Start).unwrap();
        assert_eq!(state, ScanState::Integrate { elapsed_ticks: 0 });
        state = state.on(ScanEvent::GateElapsed).unwrap();
        state = state.on(ScanEvent::RowCaptured).unwrap();
        assert_eq!(state, ScanState::LineDone { row: 0 });
        state = state.on(ScanEvent::NextRow).unwrap();
        assert_eq!(state, ScanState::Readout { row: 1, waited_ticks: 0 });
        state = state.on(ScanEvent::RowCaptured).unwrap();
        state = state.on(ScanEvent::LastRow).unwrap();
        assert_eq!(state, ScanState::FrameDone);
        assert_eq!(state.on(ScanEvent::Rearm), Some(ScanState::Idle));
    }

    #[test]
    fn test_invalid_pairs_rejected() {
        assert_eq!(ScanState::Idle.on(ScanEvent::RowCaptured), None);
        assert_eq!(ScanState::Idle.on(ScanEvent::Stop), None);
        assert_eq!(ScanState::FrameDone.on(ScanEvent::Start), None);
        assert_eq!(ScanState::Integrate { elapsed_ticks: 3 }.on(ScanEvent::NextRow), None);
    }

    #[test]
    fn test_error_only_left_by_clear() {
        let state = ScanState::Readout { row: 5, waited_ticks: 0 }
            .on(ScanEvent::Fault(ErrorCode::Timeout))
            .unwrap();
        assert_eq!(state, ScanState::Error(ErrorCode::Timeout));
        assert_eq!(state.on(ScanEvent::Stop), None);
        assert_eq!(state.on(ScanEvent::Start), None);
        assert_eq!(state.on(ScanEvent::Fault(ErrorCode::Overflow)), None);
        assert_eq!(state.on(ScanEvent::ClearAccepted), Some(ScanState::Idle));
    }

    #[test]
    fn test_stop_from_any_active_state() {
        for state in [
            ScanState::Integrate { elapsed_ticks: 1 },
            ScanState::Readout { row: 2, waited_ticks: 0 },
            ScanState::LineDone { row: 2 },
            ScanState::FrameDone,
        ] {
            assert!(state.is_scanning());
            assert_eq!(state.on(ScanEvent::Stop), Some(ScanState::Idle));
        }
    }
}
