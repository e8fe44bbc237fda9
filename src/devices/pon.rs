//! PON port: a group of ONUs behind one optical interface.

use crate::devices::identity::SerialNumber;
use crate::devices::onu::OnuHandle;
use crate::devices::oper_state::OperState;
use tokio::sync::watch;

/// A PON port and the handles of the ONUs it serves.
#[derive(Debug)]
pub struct PonPort {
    id: u32,
    oper_state: watch::Sender<OperState>,
    onus: Vec<OnuHandle>,
}

impl PonPort {
    /// Port `id` serving `onus`, initially down
    pub fn new(id: u32, onus: Vec<OnuHandle>) -> Self {
        let (oper_state, _) = watch::channel(OperState::Down);
        Self { id, oper_state, onus }
    }

    /// Port id
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Current operational state
    pub fn oper_state(&self) -> OperState {
        *self.oper_state.borrow()
    }

    pub(crate) fn set_oper_state(&self, state: OperState) {
        self.oper_state.send_replace(state);
    }

    /// ONUs on this port, ordered by id
    pub fn onus(&self) -> &[OnuHandle] {
        &self.onus
    }

    /// ONU by id
    pub fn onu(&self, onu_id: u32) -> Option<&OnuHandle> {
        self.onus.iter().find(|onu| onu.id() == onu_id)
    }

    /// ONU by serial number
    pub fn onu_by_serial(&self, serial_number: &SerialNumber) -> Option<&OnuHandle> {
        self.onus.iter().find(|onu| onu.serial_number() == *serial_number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::onu::{Onu, OnuConfig};

    #[test]
    fn test_lookup() {
        let handles: Vec<_> = (1..=3)
            .map(|id| Onu::new(0, 1, id, OnuConfig::default()).1)
            .collect();
        let pon = PonPort::new(1, handles);

        assert_eq!(pon.oper_state(), OperState::Down);
        assert_eq!(pon.onu(2).map(|onu| onu.id()), Some(2));
        assert!(pon.onu(4).is_none());

        let sn = SerialNumber::new(0, 1, 3);
        assert_eq!(pon.onu_by_serial(&sn).map(|onu| onu.id()), Some(3));

        pon.set_oper_state(OperState::Up);
        assert_eq!(pon.oper_state(), OperState::Up);
    }
}
