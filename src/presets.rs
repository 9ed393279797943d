//! The standard policy table.
//!
//! Every preset keys by client IP and counts all requests.
//!
//! | Policy          | Window | Max |
//! |-----------------|--------|-----|
//! | `api`           | 15 min | 100 |
//! | `auth`          | 15 min | 5   |
//! | `register`      | 60 min | 3   |
//! | `email`         | 60 min | 10  |
//! | `booking`       | 60 min | 20  |
//! | `passwordReset` | 60 min | 3   |
//!
//! ```rust
//! use turnstile::presets;
//!
//! let auth = presets::auth();
//! assert_eq!(auth.max(), 5);
//! assert_eq!(auth.message(), "Too many login attempts, please try again later.");
//! ```

use std::time::Duration;

use crate::policy::Policy;

pub const API: &str = "api";
pub const AUTH: &str = "auth";
pub const REGISTER: &str = "register";
pub const EMAIL: &str = "email";
pub const BOOKING: &str = "booking";
pub const PASSWORD_RESET: &str = "passwordReset";

const FIFTEEN_MINUTES: Duration = Duration::from_secs(15 * 60);
const ONE_HOUR: Duration = Duration::from_secs(60 * 60);

/// General API traffic.
pub fn api() -> Policy {
    Policy::fixed(API, FIFTEEN_MINUTES, 100, "Too many requests from this IP, please try again later.")
}

/// Login attempts.
pub fn auth() -> Policy {
    Policy::fixed(AUTH, FIFTEEN_MINUTES, 5, "Too many login attempts, please try again later.")
}

/// Account creation.
pub fn register() -> Policy {
    Policy::fixed(
        REGISTER,
        ONE_HOUR,
        3,
        "Too many accounts created from this IP, please try again later.",
    )
}

/// Outbound email triggers.
pub fn email() -> Policy {
    Policy::fixed(EMAIL, ONE_HOUR, 10, "Too many emails sent, please try again later.")
}

pub fn booking() -> Policy {
    Policy::fixed(BOOKING, ONE_HOUR, 20, "Too many booking requests, please try again later.")
}

pub fn password_reset() -> Policy {
    Policy::fixed(
        PASSWORD_RESET,
        ONE_HOUR,
        3,
        "Too many password reset requests, please try again later.",
    )
}

/// All six presets, in table order.
pub fn all() -> Vec<Policy> {
    vec![api(), auth(), register(), email(), booking(), password_reset()]
}
