//! Guard service implementation.

use chrono::Utc;
use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::{debug, error, info, instrument, warn};

use super::proto::bulwark::v1::{
    guard_service_server::GuardService, Ban, DecideRequest, DecideResponse, GetBanRequest,
    GetBanResponse, ImposeBanRequest, ImposeBanResponse, ListActiveBansRequest,
    ListActiveBansResponse, LoginAttemptRequest, LoginAttemptResponse, Offender,
    ReleaseBanRequest, ReleaseBanResponse, ReportRequest, ReportResponse, Verdict,
};

use crate::ban::BanEntry;
use crate::bruteforce::{Evaluation, NewLoginAttempt};
use crate::error::BulwarkError;
use crate::guard::Guard;
use crate::ratelimit::{ClientIdentity, Decision, DenyReason, RetryAfter};

/// Offenders listed when the request does not say how many.
const DEFAULT_TOP_OFFENDERS: usize = 10;

/// Reason recorded on operator bans that do not give one.
const DEFAULT_OPERATOR_BAN_REASON: &str = "operator ban";

/// Implementation of the GuardService gRPC interface.
pub struct GuardServiceImpl {
    /// The shared guard instance
    guard: Arc<Guard>,
}

impl GuardServiceImpl {
    /// Create a new GuardServiceImpl around the given guard.
    pub fn new(guard: Arc<Guard>) -> Self {
        Self { guard }
    }
}

fn non_empty<'a>(value: &'a str, field: &str) -> Result<&'a str, Status> {
    if value.trim().is_empty() {
        warn!(field = field, "Rejected request with empty field");
        return Err(Status::invalid_argument(format!("{} is required", field)));
    }
    Ok(value)
}

fn optional(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Map a guard error to a status. Store failures stay generic.
fn to_status(err: BulwarkError) -> Status {
    match err {
        BulwarkError::NotFound(msg) => Status::not_found(msg),
        BulwarkError::InvalidArgument(msg) => Status::invalid_argument(msg),
        other => {
            error!(error = %other, "Guard operation failed");
            Status::internal("internal error")
        }
    }
}

impl From<&BanEntry> for Ban {
    fn from(entry: &BanEntry) -> Self {
        Ban {
            id: entry.id.to_string(),
            client: entry.client.value().to_string(),
            authenticated: entry.client.is_authenticated(),
            reason: entry.reason.clone(),
            triggering_attempt_count: entry.triggering_attempt_count,
            banned_at: entry.banned_at.timestamp(),
            expires_at: entry.expires_at.map(|t| t.timestamp()),
            released_at: entry.released_at.map(|t| t.timestamp()),
            released_by: entry.released_by.clone(),
        }
    }
}

impl From<Decision> for DecideResponse {
    fn from(decision: Decision) -> Self {
        match decision {
            Decision::Allow { remaining } => DecideResponse {
                verdict: Verdict::Allow.into(),
                reason: String::new(),
                retry_after_secs: 0,
                indefinite: false,
                remaining,
            },
            Decision::Deny(denial) => {
                let verdict = match denial.reason {
                    DenyReason::RateLimited => Verdict::RateLimited,
                    DenyReason::Blocked => Verdict::Blocked,
                };
                let (retry_after_secs, indefinite) = match denial.retry_after {
                    // Round up so clients never retry inside the window
                    RetryAfter::After(d) => (d.as_secs() + u64::from(d.subsec_nanos() > 0), false),
                    RetryAfter::Indefinite => (0, true),
                };
                DecideResponse {
                    verdict: verdict.into(),
                    reason: denial.reason.as_str().to_string(),
                    retry_after_secs,
                    indefinite,
                    remaining: 0,
                }
            }
        }
    }
}

#[tonic::async_trait]
impl GuardService for GuardServiceImpl {
    /// Decide whether a request may proceed, consuming one unit of quota.
    #[instrument(
        skip(self, request),
        fields(
            client = %request.get_ref().client,
            endpoint = %request.get_ref().endpoint
        )
    )]
    async fn decide(
        &self,
        request: Request<DecideRequest>,
    ) -> Result<Response<DecideResponse>, Status> {
        let req = request.into_inner();
        let client = ClientIdentity::resolve(non_empty(&req.client, "client")?, req.authenticated);
        let endpoint = non_empty(&req.endpoint, "endpoint")?;

        let decision = self
            .guard
            .decide(&client, endpoint, Utc::now())
            .await
            .map_err(to_status)?;

        debug!(client = %client, decision = ?decision, "Rate limit decision made");
        Ok(Response::new(decision.into()))
    }

    #[instrument(skip(self, request), fields(client = %request.get_ref().client))]
    async fn record_login_attempt(
        &self,
        request: Request<LoginAttemptRequest>,
    ) -> Result<Response<LoginAttemptResponse>, Status> {
        let req = request.into_inner();
        let client = ClientIdentity::resolve(non_empty(&req.client, "client")?, req.authenticated);
        let now = Utc::now();

        let attempt = NewLoginAttempt {
            client: client.clone(),
            username: req.username,
            ip: optional(req.ip),
            user_agent: optional(req.user_agent),
            success: req.success,
            failure_reason: optional(req.failure_reason),
            rate_limited: req.rate_limited,
        };

        let outcome = self
            .guard
            .record_login_attempt(attempt, now)
            .await
            .map_err(to_status)?;
        // The attempt is already stored, so a failed count must not fail the call
        let recent_failures = match &outcome.evaluation {
            Some(Evaluation::BelowThreshold { failures }) => *failures,
            Some(Evaluation::Banned(ban)) => ban.triggering_attempt_count,
            _ => match self.guard.recent_failures(&client, now).await {
                Ok(failures) => failures,
                Err(e) => {
                    warn!(client = %client, error = %e, "Failed to count recent failures");
                    0
                }
            },
        };

        Ok(Response::new(LoginAttemptResponse {
            attempt_id: outcome.attempt_id.to_string(),
            recent_failures,
            ban: outcome.ban().map(Ban::from),
            newly_banned: outcome.newly_banned(),
        }))
    }

    async fn get_ban(
        &self,
        request: Request<GetBanRequest>,
    ) -> Result<Response<GetBanResponse>, Status> {
        let req = request.into_inner();
        let client = ClientIdentity::resolve(non_empty(&req.client, "client")?, req.authenticated);

        let ban = self
            .guard
            .is_active(&client, Utc::now())
            .await
            .map_err(to_status)?;

        Ok(Response::new(GetBanResponse {
            ban: ban.as_ref().map(Ban::from),
        }))
    }

    #[instrument(skip(self, request), fields(client = %request.get_ref().client))]
    async fn impose_ban(
        &self,
        request: Request<ImposeBanRequest>,
    ) -> Result<Response<ImposeBanResponse>, Status> {
        let req = request.into_inner();
        let client = ClientIdentity::resolve(non_empty(&req.client, "client")?, req.authenticated);
        let reason = if req.reason.trim().is_empty() {
            DEFAULT_OPERATOR_BAN_REASON
        } else {
            req.reason.as_str()
        };
        let duration = match req.duration_secs {
            0 => None,
            secs => Some(chrono::Duration::seconds(
                i64::try_from(secs)
                    .map_err(|_| Status::invalid_argument("duration_secs is too large"))?,
            )),
        };

        let outcome = self
            .guard
            .impose_ban(&client, reason, duration, Utc::now())
            .await
            .map_err(to_status)?;

        Ok(Response::new(ImposeBanResponse {
            ban: Some(Ban::from(outcome.entry())),
            created: outcome.created(),
        }))
    }

    #[instrument(
        skip(self, request),
        fields(
            client = %request.get_ref().client,
            operator = %request.get_ref().operator
        )
    )]
    async fn release_ban(
        &self,
        request: Request<ReleaseBanRequest>,
    ) -> Result<Response<ReleaseBanResponse>, Status> {
        let req = request.into_inner();
        let client = ClientIdentity::resolve(non_empty(&req.client, "client")?, req.authenticated);
        let operator = non_empty(&req.operator, "operator")?;

        let ban = self
            .guard
            .release(&client, operator, &req.reason, Utc::now())
            .await
            .map_err(to_status)?;

        info!(client = %client, operator = %operator, "Ban released via API");
        Ok(Response::new(ReleaseBanResponse {
            ban: Some(Ban::from(&ban)),
        }))
    }

    async fn list_active_bans(
        &self,
        _request: Request<ListActiveBansRequest>,
    ) -> Result<Response<ListActiveBansResponse>, Status> {
        let bans = self
            .guard
            .list_active(Utc::now())
            .await
            .map_err(to_status)?;

        Ok(Response::new(ListActiveBansResponse {
            bans: bans.iter().map(Ban::from).collect(),
        }))
    }

    async fn get_report(
        &self,
        request: Request<ReportRequest>,
    ) -> Result<Response<ReportResponse>, Status> {
        let req = request.into_inner();
        let lookback = match req.lookback_secs {
            0 => self.guard.config().brute_force.lookback(),
            secs => chrono::Duration::seconds(
                i64::try_from(secs)
                    .map_err(|_| Status::invalid_argument("lookback_secs is too large"))?,
            ),
        };
        let top = match req.top_offenders {
            0 => DEFAULT_TOP_OFFENDERS,
            n => n as usize,
        };

        let report = self
            .guard
            .report(lookback, top, Utc::now())
            .await
            .map_err(to_status)?;

        Ok(Response::new(ReportResponse {
            total_attempts: report.summary.total_attempts,
            failed_attempts: report.summary.failed_attempts,
            rate_limited_attempts: report.summary.rate_limited_attempts,
            failure_rate: report.summary.failure_rate,
            unique_clients: report.summary.unique_clients,
            blocked: report.blocked.iter().map(Ban::from).collect(),
            top_offenders: report
                .top_offenders
                .iter()
                .map(|o| Offender {
                    client: o.client.value().to_string(),
                    authenticated: o.client.is_authenticated(),
                    failures: o.failures,
                    last_failure_at: o.last_failure_at.timestamp(),
                })
                .collect(),
        }))
    }
}
