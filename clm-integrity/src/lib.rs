//! # clm-integrity
//!
//! Referential-integrity repair for `team_league_memberships`.
//!
//! - [`orphans`]: find teams with no active league membership
//! - [`rules`]: versioned team → league classification tables
//! - [`repair`]: insert the missing memberships, then re-check
//! - [`checks`]: integrity checks shared with the inventory verifier

pub mod checks;
pub mod orphans;
pub mod repair;
pub mod rules;
