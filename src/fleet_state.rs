/// What a pass has to do to converge the fleet size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScaleAction {
    Out(u32),
    In(u32),
    Steady,
}

/// Desired versus observed machine count for one pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeFleetState {
    pub desired: u32,
    pub joined: u32,
}

impl NodeFleetState {
    pub fn new(desired: u32, joined: u32) -> Self {
        Self { desired, joined }
    }

    pub fn delta(&self) -> i64 {
        i64::from(self.desired) - i64::from(self.joined)
    }

    pub fn action(&self) -> ScaleAction {
        match self.delta() {
            d if d > 0 => ScaleAction::Out(d as u32),
            d if d < 0 => ScaleAction::In(d.unsigned_abs() as u32),
            _ => ScaleAction::Steady,
        }
    }

    pub fn machine_joined(&mut self) {
        self.joined += 1;
    }

    pub fn machine_removed(&mut self) {
        self.joined = self.joined.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scale_action_follows_delta() {
        assert_eq!(NodeFleetState::new(3, 1).action(), ScaleAction::Out(2));
        assert_eq!(NodeFleetState::new(1, 4).action(), ScaleAction::In(3));
        assert_eq!(NodeFleetState::new(2, 2).action(), ScaleAction::Steady);
        assert_eq!(NodeFleetState::new(0, 0).action(), ScaleAction::Steady);
    }

    #[test]
    fn tracked_count_never_underflows() {
        let mut state = NodeFleetState::new(0, 1);
        state.machine_removed();
        state.machine_removed();
        assert_eq!(state.joined, 0);
        state.machine_joined();
        assert_eq!(state.delta(), -1);
    }
}
