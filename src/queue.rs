//! Kernel packet queue dispatch.
//!
//! Packets sent to an NFQUEUE by an iptables/nftables rule are received one at
//! a time, decided by the [`Orchestrator`] and handed back with their verdict.

use crate::core::orchestrator::Orchestrator;
use crate::error::FirewallError;

#[cfg(target_os = "linux")]
mod nfqueue {
    use log::{debug, info, warn};

    use crate::core::orchestrator::{Orchestrator, PacketHandle};
    use crate::error::FirewallError;

    /// A received message; the verdict is sent to the kernel as soon as it is set
    struct QueuedMessage<'q> {
        queue: &'q mut nfq::Queue,
        queue_num: u16,
        msg: Option<nfq::Message>,
    }

    impl QueuedMessage<'_> {
        fn release(&mut self, verdict: nfq::Verdict) {
            let Some(mut msg) = self.msg.take() else {
                return;
            };
            msg.set_verdict(verdict);
            if let Err(e) = self.queue.verdict(msg) {
                warn!("Failed to send verdict to NFQUEUE {}: {}", self.queue_num, e);
            }
        }
    }

    impl PacketHandle for QueuedMessage<'_> {
        fn payload(&self) -> &[u8] {
            self.msg.as_ref().map_or(&[][..], |msg| msg.get_payload())
        }

        fn accept(&mut self) {
            self.release(nfq::Verdict::Accept);
        }

        fn drop_packet(&mut self) {
            self.release(nfq::Verdict::Drop);
        }
    }

    pub fn run(queue_num: u16, orchestrator: &mut Orchestrator) -> Result<(), FirewallError> {
        let mut queue = nfq::Queue::open()?;
        queue.bind(queue_num)?;
        info!("Bound to NFQUEUE {}", queue_num);

        loop {
            let msg = match queue.recv() {
                Ok(msg) => msg,
                Err(e) => {
                    warn!("Failed to receive from NFQUEUE {}: {}", queue_num, e);
                    continue;
                }
            };

            let mut packet = QueuedMessage {
                queue: &mut queue,
                queue_num,
                msg: Some(msg),
            };
            let verdict = orchestrator.handle(&mut packet);
            debug!("Verdict {} for queued packet", verdict);
        }
    }
}

/// Bind `queue_num` and process packets until the process exits
///
/// Only returns if the queue cannot be opened or bound.
#[cfg(target_os = "linux")]
pub fn run(queue_num: u16, orchestrator: &mut Orchestrator) -> Result<(), FirewallError> {
    nfqueue::run(queue_num, orchestrator)
}

#[cfg(not(target_os = "linux"))]
pub fn run(queue_num: u16, _orchestrator: &mut Orchestrator) -> Result<(), FirewallError> {
    Err(FirewallError::Unsupported(format!(
        "NFQUEUE {} requires Linux netfilter",
        queue_num
    )))
}
