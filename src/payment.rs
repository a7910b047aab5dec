//! Payment confirmation flow for the two checkout gateways.
//!
//! ```text
//! begin_checkout ──▶ Modal ──▶ confirm_modal_payment ──▶ paid
//!       │                    (client callback, optimistic)
//!       └──────────▶ Redirect ──▶ gateway ──▶ handle_return(url)
//!                                               └─▶ capture ──▶ paid
//! ```
//!
//! A locally recorded payment only gates the UI. Paid exports are authorised
//! by the backend, which learns about payments from the gateway webhooks.

use crate::backend::{CaptureRequest, CheckoutRequest, CheckoutSession};
use crate::controller::{lock, within, JobController};
use crate::error::HandDocError;
use crate::job::{Gateway, JobEvent, JobRecord, JobState, KeyValueStore, PaymentReceipt};
use reqwest::Url;
use tracing::{error, info, warn};

/// Query parameter the redirect gateway appends when sending the user back.
pub const RETURN_TOKEN_PARAM: &str = "token";
/// Also appended on return; dropped together with the token.
const PAYER_ID_PARAM: &str = "PayerID";

/// Result of processing a gateway return URL.
#[derive(Debug, Clone, PartialEq)]
pub enum ReturnOutcome {
    /// The URL carried no capture token; nothing was done.
    NoToken,
    /// The token was captured (or had been already). `clean_url` is the URL
    /// to navigate to so the token is not seen again.
    Captured { job: JobRecord, clean_url: String },
}

impl<S: KeyValueStore + 'static> JobController<S> {
    /// Open a checkout for the ready job and take the payment lock.
    ///
    /// The lock is released by [`cancel_checkout`](Self::cancel_checkout), by
    /// a confirmed payment, or when opening the checkout fails.
    pub async fn begin_checkout(&self) -> Result<CheckoutSession, HandDocError> {
        let job = self.active()?;
        if job.state != JobState::Ready {
            return Err(HandDocError::ActionNotAvailable {
                action: "pay for",
                state: job.state,
            });
        }
        {
            let mut checkout = lock(&self.inner.checkout);
            if checkout.as_deref() == Some(job.job_id.as_str()) {
                return Err(HandDocError::PaymentInProgress);
            }
            *checkout = Some(job.job_id.clone());
        }

        let request = CheckoutRequest {
            job_id: job.job_id.clone(),
        };
        let result = within(
            "checkout",
            self.inner.config.request_timeout(),
            self.inner.backend.create_checkout(&request),
        )
        .await
        .and_then(validate_session);

        match result {
            Ok(session) => {
                info!("Checkout opened for job {}", job.job_id);
                Ok(session)
            }
            Err(e) => {
                error!("Checkout for job {} failed: {}", job.job_id, e);
                self.cancel_checkout();
                self.report(Some(&job.job_id), &e);
                Err(e)
            }
        }
    }

    /// Release the payment lock, e.g. when the user dismisses the dialog.
    pub fn cancel_checkout(&self) {
        if let Some(job_id) = lock(&self.inner.checkout).take() {
            info!("Checkout for job {} released", job_id);
        }
    }

    pub fn checkout_in_progress(&self) -> bool {
        lock(&self.inner.checkout).is_some()
    }

    /// Record a payment confirmed by the modal gateway's client callback.
    ///
    /// Optimistic and idempotent: a second call for an already-paid job
    /// leaves it paid with its first receipt.
    pub fn confirm_modal_payment(&self, order_id: &str) -> Result<JobRecord, HandDocError> {
        let (job, _) = self.modify(None, |j| {
            j.apply(JobEvent::PaymentConfirmed)?;
            if j.payment.is_none() {
                j.payment = Some(PaymentReceipt {
                    gateway: Gateway::Razorpay,
                    order_id: order_id.to_string(),
                    confirmed_at: crate::job::record::now_millis(),
                });
            }
            Ok(())
        })?;
        self.cancel_checkout();
        info!("Payment confirmed for job {} (order {})", job.job_id, order_id);
        Ok(job)
    }

    /// Handle the URL the redirect gateway sent the user back to.
    pub async fn handle_return(&self, url: &str) -> Result<ReturnOutcome, HandDocError> {
        let parsed = parse_url(url)?;
        let Some(token) = parsed
            .query_pairs()
            .find(|(k, _)| k == RETURN_TOKEN_PARAM)
            .map(|(_, v)| v.into_owned())
            .filter(|t| !t.is_empty())
        else {
            return Ok(ReturnOutcome::NoToken);
        };
        let job = self.capture(&token).await?;
        Ok(ReturnOutcome::Captured {
            job,
            clean_url: strip_return_token(url)?,
        })
    }

    /// Capture an approved redirect-gateway order and mark the job paid.
    ///
    /// On failure the job keeps its state. A job that is already paid is
    /// returned as-is without contacting the gateway again.
    pub async fn capture(&self, order_id: &str) -> Result<JobRecord, HandDocError> {
        let job = self.active()?;
        match job.state {
            JobState::Ready => {}
            JobState::Paid | JobState::Exporting => {
                match &job.payment {
                    Some(receipt) if receipt.order_id == order_id => {
                        info!("Order {} already captured", order_id)
                    }
                    _ => warn!("Job {} is already paid; not capturing {}", job.job_id, order_id),
                }
                self.cancel_checkout();
                return Ok(job);
            }
            state => {
                return Err(HandDocError::ActionNotAvailable {
                    action: "capture a payment for",
                    state,
                })
            }
        }

        let request = CaptureRequest {
            order_id: order_id.to_string(),
        };
        let result = within(
            "capture",
            self.inner.config.request_timeout(),
            self.inner.backend.capture(&request),
        )
        .await;

        let failure = match result {
            Ok(response) if response.success => None,
            Ok(response) => Some(
                response
                    .error
                    .unwrap_or_else(|| "the gateway declined the capture".to_string()),
            ),
            Err(e) => Some(e.to_string()),
        };
        if let Some(reason) = failure {
            let e = HandDocError::CaptureFailed {
                order_id: order_id.to_string(),
                reason,
            };
            error!("{}", e);
            self.cancel_checkout();
            self.report(Some(&job.job_id), &e);
            return Err(e);
        }

        let (job, _) = self.modify(Some(&job.job_id), |j| {
            j.apply(JobEvent::PaymentConfirmed)?;
            j.payment = Some(PaymentReceipt {
                gateway: Gateway::Paypal,
                order_id: order_id.to_string(),
                confirmed_at: crate::job::record::now_millis(),
            });
            Ok(())
        })?;
        self.cancel_checkout();
        info!("Captured order {} for job {}", order_id, job.job_id);
        Ok(job)
    }
}

fn validate_session(session: CheckoutSession) -> Result<CheckoutSession, HandDocError> {
    match &session {
        CheckoutSession::Redirect { approve_url } => {
            let url = approve_url.as_deref().unwrap_or_default();
            if url.is_empty() || Url::parse(url).is_err() {
                return Err(HandDocError::ProtocolViolation {
                    operation: "checkout".into(),
                    detail: format!("redirect checkout without a usable approval URL ('{}')", url),
                });
            }
        }
        CheckoutSession::Modal { key, order } => {
            if key.is_empty() || order.id.is_empty() {
                return Err(HandDocError::ProtocolViolation {
                    operation: "checkout".into(),
                    detail: "modal checkout without a key or order id".into(),
                });
            }
        }
    }
    Ok(session)
}

fn parse_url(url: &str) -> Result<Url, HandDocError> {
    Url::parse(url).map_err(|e| HandDocError::ProtocolViolation {
        operation: "payment return".into(),
        detail: format!("'{}' is not a URL: {}", url, e),
    })
}

/// `url` without the capture token, so reloading it never captures again.
pub fn strip_return_token(url: &str) -> Result<String, HandDocError> {
    let mut parsed = parse_url(url)?;
    let kept: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| k != RETURN_TOKEN_PARAM && k != PAYER_ID_PARAM)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        parsed.set_query(None);
    } else {
        parsed.query_pairs_mut().clear().extend_pairs(kept);
    }
    Ok(parsed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::GatewayOrder;

    #[test]
    fn strips_token_and_payer() {
        assert_eq!(
            strip_return_token("https://app.example/preview?jobId=j1&token=ORDER1&PayerID=P9")
                .unwrap(),
            "https://app.example/preview?jobId=j1"
        );
        assert_eq!(
            strip_return_token("https://app.example/preview?token=ORDER1").unwrap(),
            "https://app.example/preview"
        );
    }

    #[test]
    fn redirect_session_needs_approval_url() {
        assert!(validate_session(CheckoutSession::Redirect { approve_url: None }).is_err());
        assert!(validate_session(CheckoutSession::Redirect {
            approve_url: Some("https://pay.example/x".into())
        })
        .is_ok());
        assert!(validate_session(CheckoutSession::Modal {
            key: "rzp".into(),
            order: GatewayOrder {
                id: "order_1".into(),
                amount: 4900,
                currency: "INR".into(),
            },
        })
        .is_ok());
    }
}
