//! An in-process transport between threads.
use std::{
    cell::RefCell,
    sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender},
    time::{Duration, Instant},
};

use super::{check_rank, MessageTag, Transport};
use crate::types::TransportError;

enum Payload {
    Indices(Vec<u64>),
    Values(Vec<f64>),
}

struct Envelope {
    source: usize,
    tag: MessageTag,
    payload: Payload,
}

/// A transport connecting a group of ranks living in the same process.
///
/// Each rank owns one end of the group, typically moved into its own thread.
/// Receives give up after a liveness timeout instead of blocking forever, so a
/// rank that dies or never sends fails the run instead of stalling it.
pub struct LocalTransport {
    rank: usize,
    senders: Vec<Sender<Envelope>>,
    receiver: Receiver<Envelope>,
    pending: RefCell<Vec<Envelope>>,
    timeout: Duration,
}

impl LocalTransport {
    /// Create a connected group of `size` ranks.
    ///
    /// The i-th element of the result is rank i.
    pub fn group(size: usize, timeout: Duration) -> Vec<Self> {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..size).map(|_| channel()).unzip();

        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, receiver)| Self {
                rank,
                senders: senders.clone(),
                receiver,
                pending: RefCell::new(Vec::new()),
                timeout,
            })
            .collect()
    }

    /// The liveness timeout of blocking receives.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn post(&self, dest: usize, tag: MessageTag, payload: Payload) -> Result<(), TransportError> {
        check_rank(dest, self.size())?;

        self.senders[dest]
            .send(Envelope {
                source: self.rank,
                tag,
                payload,
            })
            .map_err(|_| TransportError::Send {
                rank: dest,
                what: tag.describe().to_string(),
            })
    }

    fn take(&self, source: usize, tag: MessageTag) -> Result<Payload, TransportError> {
        check_rank(source, self.size())?;

        // Messages that arrived while waiting for something else are buffered.
        {
            let mut pending = self.pending.borrow_mut();
            if let Some(position) = pending
                .iter()
                .position(|envelope| envelope.source == source && envelope.tag == tag)
            {
                return Ok(pending.remove(position).payload);
            }
        }

        let deadline = Instant::now() + self.timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.receiver.recv_timeout(remaining) {
                Ok(envelope) if envelope.source == source && envelope.tag == tag => {
                    return Ok(envelope.payload)
                }
                Ok(envelope) => self.pending.borrow_mut().push(envelope),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(TransportError::Timeout {
                        rank: source,
                        what: tag.describe().to_string(),
                        timeout: self.timeout,
                    })
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(TransportError::Receive {
                        rank: source,
                        what: tag.describe().to_string(),
                    })
                }
            }
        }
    }

    fn mismatch(source: usize, tag: MessageTag, expected: &str) -> TransportError {
        TransportError::Malformed {
            rank: source,
            what: tag.describe().to_string(),
            reason: format!("expected {} payload", expected),
        }
    }
}

impl Transport for LocalTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.senders.len()
    }

    fn send_indices(
        &self,
        dest: usize,
        tag: MessageTag,
        data: &[u64],
    ) -> Result<(), TransportError> {
        self.post(dest, tag, Payload::Indices(data.to_vec()))
    }

    fn receive_indices(&self, source: usize, tag: MessageTag) -> Result<Vec<u64>, TransportError> {
        match self.take(source, tag)? {
            Payload::Indices(data) => Ok(data),
            Payload::Values(_) => Err(Self::mismatch(source, tag, "index")),
        }
    }

    fn send_values(
        &self,
        dest: usize,
        tag: MessageTag,
        data: &[f64],
    ) -> Result<(), TransportError> {
        self.post(dest, tag, Payload::Values(data.to_vec()))
    }

    fn receive_values(&self, source: usize, tag: MessageTag) -> Result<Vec<f64>, TransportError> {
        match self.take(source, tag)? {
            Payload::Values(data) => Ok(data),
            Payload::Indices(_) => Err(Self::mismatch(source, tag, "value")),
        }
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn broadcast_indices(&self, root: usize, data: &mut [u64]) -> Result<(), TransportError> {
        check_rank(root, self.size())?;

        if self.rank == root {
            // Reach every live rank before reporting the first failure.
            let mut first_err = None;
            for dest in (0..self.size()).filter(|&dest| dest != root) {
                if let Err(err) = self.send_indices(dest, MessageTag::Parameters, data) {
                    first_err = first_err.or(Some(err));
                }
            }
            if let Some(err) = first_err {
                return Err(err);
            }
        } else {
            let received = self.receive_indices(root, MessageTag::Parameters)?;
            if received.len() != data.len() {
                return Err(TransportError::Malformed {
                    rank: root,
                    what: MessageTag::Parameters.describe().to_string(),
                    reason: format!("expected {} entries, got {}", data.len(), received.len()),
                });
            }
            data.copy_from_slice(&received);
        }

        Ok(())
    }

    fn gather_values(
        &self,
        root: usize,
        local: &[f64],
    ) -> Result<Option<(Vec<f64>, Vec<usize>)>, TransportError> {
        check_rank(root, self.size())?;

        if self.rank != root {
            self.send_values(root, MessageTag::Potentials, local)?;
            return Ok(None);
        }

        let mut gathered = Vec::new();
        let mut counts = Vec::with_capacity(self.size());

        for source in 0..self.size() {
            if source == root {
                gathered.extend_from_slice(local);
                counts.push(local.len());
            } else {
                let received = self.receive_values(source, MessageTag::Potentials)?;
                counts.push(received.len());
                gathered.extend(received);
            }
        }

        Ok(Some((gathered, counts)))
    }
}

#[cfg(test)]
mod test {
    use std::{thread, time::Duration};

    use super::LocalTransport;
    use crate::{
        transport::{MessageTag, Transport},
        types::TransportError,
    };

    const TIMEOUT: Duration = Duration::from_secs(10);

    #[test]
    fn test_point_to_point_out_of_order() {
        let mut group = LocalTransport::group(2, TIMEOUT);
        let second = group.pop().unwrap();
        let first = group.pop().unwrap();

        let handle = thread::spawn(move || {
            second.send_values(0, MessageTag::Weights, &[1.5, 2.5]).unwrap();
            second.send_indices(0, MessageTag::Header, &[7, 8, 9]).unwrap();
        });

        // The header is requested first although it is sent second.
        assert_eq!(
            first.receive_indices(1, MessageTag::Header).unwrap(),
            vec![7, 8, 9]
        );
        assert_eq!(
            first.receive_values(1, MessageTag::Weights).unwrap(),
            vec![1.5, 2.5]
        );

        handle.join().unwrap();
    }

    #[test]
    fn test_broadcast_and_gather() {
        let group = LocalTransport::group(4, TIMEOUT);

        let results = thread::scope(|s| {
            let handles = group
                .into_iter()
                .map(|transport| {
                    s.spawn(move || {
                        let mut params = if transport.rank() == 0 {
                            vec![3, 1, 4]
                        } else {
                            vec![0; 3]
                        };
                        transport.broadcast_indices(0, &mut params).unwrap();
                        assert_eq!(params, vec![3, 1, 4]);

                        let local = vec![transport.rank() as f64; transport.rank()];
                        transport.gather_values(0, &local).unwrap()
                    })
                })
                .collect::<Vec<_>>();

            handles
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .collect::<Vec<_>>()
        });

        let (gathered, counts) = results[0].clone().unwrap();
        assert_eq!(counts, vec![0, 1, 2, 3]);
        assert_eq!(gathered, vec![1.0, 2.0, 2.0, 3.0, 3.0, 3.0]);
        assert!(results[1..].iter().all(|result| result.is_none()));
    }

    #[test]
    fn test_receive_times_out() {
        let group = LocalTransport::group(2, Duration::from_millis(20));

        let result = group[0].receive_indices(1, MessageTag::Header);
        assert!(matches!(result, Err(TransportError::Timeout { rank: 1, .. })));
    }

    #[test]
    fn test_payload_mismatch_and_unknown_rank() {
        let group = LocalTransport::group(2, TIMEOUT);

        group[1].send_values(0, MessageTag::Boxes, &[1.0]).unwrap();
        assert!(matches!(
            group[0].receive_indices(1, MessageTag::Boxes),
            Err(TransportError::Malformed { .. })
        ));

        assert!(matches!(
            group[0].send_indices(5, MessageTag::Boxes, &[]),
            Err(TransportError::UnknownRank(5))
        ));
    }

    #[test]
    fn test_send_to_dropped_rank_fails() {
        let mut group = LocalTransport::group(2, TIMEOUT);
        drop(group.pop());

        assert!(matches!(
            group[0].send_indices(1, MessageTag::Header, &[1]),
            Err(TransportError::Send { rank: 1, .. })
        ));
    }

    #[test]
    fn test_broadcast_past_dropped_rank() {
        let mut group = LocalTransport::group(3, TIMEOUT);
        let last = group.pop().unwrap();
        drop(group.pop());

        let mut data = [4, 5];
        assert!(matches!(
            group[0].broadcast_indices(0, &mut data),
            Err(TransportError::Send { rank: 1, .. })
        ));

        let mut received = [0, 0];
        last.broadcast_indices(0, &mut received).unwrap();
        assert_eq!(received, [4, 5]);
    }
}
