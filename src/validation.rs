//! Message validation.
//!
//! Topics may register a validator: a pure function from message to verdict.
//! Validators run on a fixed pool of workers with a bounded intake queue;
//! when the queue is full new work is *ignored* rather than rejected, so a
//! slow validator cannot be abused to penalize honest senders. Signature
//! verification, when enabled, runs on the worker before the user validator.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing::{trace, warn};

use crate::identity::{verify_message, PeerId};
use crate::wire::Message;

/// Validator outcome for a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Deliver locally and forward.
    Accept,
    /// Drop and penalize the propagating peer.
    Reject(RejectReason),
    /// Drop without penalty.
    Ignore,
}

/// Why a message was not accepted. Carried on trace events and mapped onto
/// score updates; the two `Validation*` queue reasons describe ignores and
/// never penalize.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectReason {
    /// Malformed with respect to the signing policy (e.g. unexpected
    /// signature fields under strict-none).
    ValidationError,
    /// Signature missing or failed to verify.
    SignatureError,
    /// The message claims the local node as its origin.
    SelfOrigin,
    /// The propagating peer is blacklisted.
    BlacklistedPeer,
    /// The message origin is blacklisted.
    BlacklistedSource,
    /// A topic validator returned Reject.
    ValidationFailed,
    /// A topic validator returned Ignore or timed out.
    ValidationIgnored,
    /// The validation pool or the topic throttle was saturated.
    ValidationQueueFull,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationError => "validation error",
            Self::SignatureError => "invalid signature",
            Self::SelfOrigin => "self originated",
            Self::BlacklistedPeer => "blacklisted peer",
            Self::BlacklistedSource => "blacklisted source",
            Self::ValidationFailed => "validation failed",
            Self::ValidationIgnored => "validation ignored",
            Self::ValidationQueueFull => "validation queue full",
        }
    }

    /// Ignore-class reasons do not feed the score subsystem.
    pub fn penalizes(&self) -> bool {
        !matches!(self, Self::ValidationIgnored | Self::ValidationQueueFull)
    }
}

/// A registered topic validator.
pub type Validator = Arc<dyn Fn(&Message) -> Verdict + Send + Sync>;

pub(crate) struct ValidationRequest {
    pub from: PeerId,
    pub msg: Message,
    pub validator: Option<Validator>,
    /// Run signature verification before the validator.
    pub verify_signature: bool,
}

impl std::fmt::Debug for ValidationRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidationRequest")
            .field("from", &self.from)
            .field("msg", &self.msg)
            .field("validator", &self.validator.is_some())
            .field("verify_signature", &self.verify_signature)
            .finish()
    }
}

pub(crate) struct ValidationOutcome {
    pub from: PeerId,
    pub msg: Message,
    pub verdict: Verdict,
}

/// Fixed set of workers draining a bounded intake queue. Verdicts come back
/// to the event loop asynchronously on the outcome channel.
pub(crate) struct ValidatorPool {
    intake: mpsc::Sender<ValidationRequest>,
}

impl ValidatorPool {
    pub fn spawn(
        workers: usize,
        queue_len: usize,
        timeout: Duration,
        outcome_tx: mpsc::Sender<ValidationOutcome>,
    ) -> Self {
        let (intake, rx) = mpsc::channel::<ValidationRequest>(queue_len.max(1));
        let rx = Arc::new(Mutex::new(rx));
        for _ in 0..workers.max(1) {
            let rx = rx.clone();
            let outcome_tx = outcome_tx.clone();
            tokio::spawn(async move {
                loop {
                    let request = { rx.lock().await.recv().await };
                    let Some(request) = request else { break };
                    let outcome = run_one(request, timeout).await;
                    if outcome_tx.send(outcome).await.is_err() {
                        break;
                    }
                }
            });
        }
        Self { intake }
    }

    /// Non-blocking submission; hands the request back when saturated so the
    /// caller can apply the ignore policy.
    pub fn try_submit(&self, request: ValidationRequest) -> Result<(), ValidationRequest> {
        self.intake.try_send(request).map_err(|e| match e {
            mpsc::error::TrySendError::Full(r) | mpsc::error::TrySendError::Closed(r) => r,
        })
    }
}

async fn run_one(request: ValidationRequest, timeout: Duration) -> ValidationOutcome {
    let ValidationRequest {
        from,
        msg,
        validator,
        verify_signature,
    } = request;

    if verify_signature {
        let verdict = match &msg.signature {
            None => Some(Verdict::Reject(RejectReason::SignatureError)),
            Some(sig) => {
                match verify_message(
                    &msg.from,
                    &msg.topic,
                    msg.seqno,
                    &msg.data,
                    sig,
                    msg.key.as_deref(),
                ) {
                    Ok(()) => None,
                    Err(e) => {
                        trace!(
                            from = %from,
                            origin = %msg.from,
                            error = %e,
                            "message signature rejected"
                        );
                        Some(Verdict::Reject(RejectReason::SignatureError))
                    }
                }
            }
        };
        if let Some(verdict) = verdict {
            return ValidationOutcome { from, msg, verdict };
        }
    }

    let Some(validator) = validator else {
        return ValidationOutcome {
            from,
            msg,
            verdict: Verdict::Accept,
        };
    };

    let probe = msg.clone();
    let result = tokio::time::timeout(
        timeout,
        tokio::task::spawn_blocking(move || validator(&probe)),
    )
    .await;

    let verdict = match result {
        Ok(Ok(verdict)) => verdict,
        Ok(Err(_)) => {
            warn!(topic = %msg.topic, "topic validator panicked, ignoring message");
            Verdict::Ignore
        }
        Err(_) => {
            warn!(topic = %msg.topic, "topic validator timed out, ignoring message");
            Verdict::Ignore
        }
    };

    ValidationOutcome { from, msg, verdict }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    fn message(kp: &Keypair, signed: bool) -> Message {
        let data = b"payload".to_vec();
        let signature = signed.then(|| kp.sign_message("t", 1, &data));
        Message {
            from: kp.peer_id(),
            seqno: 1,
            topic: "t".to_string(),
            data,
            signature,
            key: None,
        }
    }

    #[tokio::test]
    async fn accepts_without_validator() {
        let (tx, mut rx) = mpsc::channel(4);
        let pool = ValidatorPool::spawn(1, 4, Duration::from_secs(1), tx);
        let kp = Keypair::generate();
        pool.try_submit(ValidationRequest {
            from: kp.peer_id(),
            msg: message(&kp, false),
            validator: None,
            verify_signature: false,
        })
        .unwrap();
        assert_eq!(rx.recv().await.unwrap().verdict, Verdict::Accept);
    }

    #[tokio::test]
    async fn signature_checked_before_validator() {
        let (tx, mut rx) = mpsc::channel(4);
        let pool = ValidatorPool::spawn(1, 4, Duration::from_secs(1), tx);
        let kp = Keypair::generate();

        // Unsigned message under mandatory verification is rejected even
        // though the validator would accept it.
        let always_accept: Validator = Arc::new(|_| Verdict::Accept);
        pool.try_submit(ValidationRequest {
            from: kp.peer_id(),
            msg: message(&kp, false),
            validator: Some(always_accept.clone()),
            verify_signature: true,
        })
        .unwrap();
        assert_eq!(
            rx.recv().await.unwrap().verdict,
            Verdict::Reject(RejectReason::SignatureError)
        );

        pool.try_submit(ValidationRequest {
            from: kp.peer_id(),
            msg: message(&kp, true),
            validator: Some(always_accept),
            verify_signature: true,
        })
        .unwrap();
        assert_eq!(rx.recv().await.unwrap().verdict, Verdict::Accept);
    }

    #[tokio::test]
    async fn validator_verdicts_propagate() {
        let (tx, mut rx) = mpsc::channel(4);
        let pool = ValidatorPool::spawn(2, 4, Duration::from_secs(1), tx);
        let kp = Keypair::generate();
        let reject_zero: Validator = Arc::new(|m: &Message| {
            if m.data.first() == Some(&0) {
                Verdict::Reject(RejectReason::ValidationFailed)
            } else {
                Verdict::Accept
            }
        });

        let mut msg = message(&kp, false);
        msg.data = vec![0, 1, 2];
        pool.try_submit(ValidationRequest {
            from: kp.peer_id(),
            msg,
            validator: Some(reject_zero),
            verify_signature: false,
        })
        .unwrap();
        assert_eq!(
            rx.recv().await.unwrap().verdict,
            Verdict::Reject(RejectReason::ValidationFailed)
        );
    }

    #[tokio::test]
    async fn timeout_yields_ignore() {
        let (tx, mut rx) = mpsc::channel(4);
        let pool = ValidatorPool::spawn(1, 4, Duration::from_millis(20), tx);
        let kp = Keypair::generate();
        let stall: Validator = Arc::new(|_| {
            std::thread::sleep(Duration::from_millis(200));
            Verdict::Accept
        });
        pool.try_submit(ValidationRequest {
            from: kp.peer_id(),
            msg: message(&kp, false),
            validator: Some(stall),
            verify_signature: false,
        })
        .unwrap();
        assert_eq!(rx.recv().await.unwrap().verdict, Verdict::Ignore);
    }

    #[tokio::test]
    async fn saturation_hands_request_back() {
        let (tx, _rx) = mpsc::channel(1);
        // One worker blocked forever, queue of one.
        let pool = ValidatorPool::spawn(1, 1, Duration::from_secs(5), tx);
        let kp = Keypair::generate();
        let stall: Validator = Arc::new(|_| {
            std::thread::sleep(Duration::from_secs(2));
            Verdict::Accept
        });
        let mut saturated = false;
        for _ in 0..8 {
            let request = ValidationRequest {
                from: kp.peer_id(),
                msg: message(&kp, false),
                validator: Some(stall.clone()),
                verify_signature: false,
            };
            if pool.try_submit(request).is_err() {
                saturated = true;
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(saturated, "pool should report saturation");
    }

    #[test]
    fn queue_reasons_do_not_penalize() {
        assert!(!RejectReason::ValidationIgnored.penalizes());
        assert!(!RejectReason::ValidationQueueFull.penalizes());
        assert!(RejectReason::ValidationFailed.penalizes());
        assert!(RejectReason::SignatureError.penalizes());
    }
}
