//! Confirmation tokens for destructive operations.
//!
//! A token is bound to one plan id and the exact operation list (by digest),
//! and signed with a per-process secret so it cannot be forged by the model
//! or replayed onto a different plan.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::models::plan::{Plan, PlanId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TokenScope {
    /// Deletes into the holding area and overwrites
    Standard,
    /// Also permits permanent deletes
    Permanent,
}

impl TokenScope {
    fn as_str(&self) -> &'static str {
        match self {
            TokenScope::Standard => "standard",
            TokenScope::Permanent => "permanent",
        }
    }
}

/// What the user is being asked to approve
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationChallenge {
    pub plan_id: PlanId,
    pub digest: String,
    pub destructive_operations: Vec<usize>,
    pub requires_permanent: bool,
    /// Human-readable lines, one per destructive operation
    pub summary: Vec<String>,
}

impl ConfirmationChallenge {
    pub fn for_plan(plan: &Plan) -> Self {
        let destructive_operations = plan.destructive_indices();
        let summary = destructive_operations
            .iter()
            .filter_map(|i| plan.operations().get(*i))
            .map(|op| op.to_string())
            .collect();
        Self {
            plan_id: plan.id,
            digest: plan.digest(),
            destructive_operations,
            requires_permanent: plan.needs_permanent_scope(),
            summary,
        }
    }

    pub fn required_scope(&self) -> TokenScope {
        if self.requires_permanent {
            TokenScope::Permanent
        } else {
            TokenScope::Standard
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationToken {
    pub plan_id: PlanId,
    pub scope: TokenScope,
    pub signature: String,
}

/// Issues and verifies tokens with a secret that lives only in this process
pub struct ConfirmationAuthority {
    secret: [u8; 32],
}

impl std::fmt::Debug for ConfirmationAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfirmationAuthority")
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl Default for ConfirmationAuthority {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfirmationAuthority {
    pub fn new() -> Self {
        let mut secret = [0u8; 32];
        secret[..16].copy_from_slice(uuid::Uuid::new_v4().as_bytes());
        secret[16..].copy_from_slice(uuid::Uuid::new_v4().as_bytes());
        Self { secret }
    }

    fn sign(&self, plan_id: PlanId, digest: &str, scope: TokenScope) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.secret);
        hasher.update(plan_id.0.to_be_bytes());
        hasher.update(digest.as_bytes());
        hasher.update(scope.as_str().as_bytes());
        URL_SAFE_NO_PAD.encode(hasher.finalize())
    }

    /// Grant a token for the challenge. Callers do this only after the user
    /// explicitly approved.
    pub fn grant(&self, challenge: &ConfirmationChallenge, scope: TokenScope) -> ConfirmationToken {
        ConfirmationToken {
            plan_id: challenge.plan_id,
            scope,
            signature: self.sign(challenge.plan_id, &challenge.digest, scope),
        }
    }

    /// Whether the plan carries a token that covers all its destructive operations
    pub fn verify(&self, plan: &Plan) -> bool {
        let Some(token) = &plan.confirmation else {
            return false;
        };
        if token.plan_id != plan.id {
            return false;
        }
        if plan.needs_permanent_scope() && token.scope < TokenScope::Permanent {
            return false;
        }
        token.signature == self.sign(plan.id, &plan.digest(), token.scope)
    }
}
