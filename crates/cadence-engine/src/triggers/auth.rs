// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Webhook credential checks.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_PREFIX: &str = "sha256=";

/// Check a webhook credential against the trigger secret.
///
/// Accepts the shared secret itself or `sha256=<hex>`, an HMAC-SHA256 of
/// `body` keyed with the secret. Both comparisons are constant-time.
pub fn verify_webhook_credential(secret: &str, credential: Option<&str>, body: &[u8]) -> bool {
    let Some(credential) = credential else {
        return false;
    };

    if let Some(signature) = credential.strip_prefix(SIGNATURE_PREFIX)
        && let Ok(expected) = hex::decode(signature.trim())
        && let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes())
    {
        mac.update(body);
        if mac.verify_slice(&expected).is_ok() {
            return true;
        }
    }

    constant_time_eq(secret.as_bytes(), credential.as_bytes())
}

/// `sha256=<hex>` signature of `body`, as a caller would send it.
pub fn sign_body(secret: &str, body: &[u8]) -> String {
    // HMAC accepts keys of any length.
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    format!(
        "{}{}",
        SIGNATURE_PREFIX,
        hex::encode(mac.finalize().into_bytes())
    )
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
