//! # clm-identity
//!
//! Clerk → Firebase identity migration for the `users` table.
//!
//! - [`phase1`]: add the nullable `firebase_uid` and profile columns
//! - [`phase2`]: backfill `firebase_uid` through an [`mapping::IdentityMapper`]
//! - [`phase3`]: gate on identity invariants, then enforce them and drop
//!   `clerk_user_id`
//! - [`rollback`]: undo Phase 3 constraints (not the column drop)
//! - [`status`]: per-user migration state counts
//!
//! Phases 1 and 3 are also steps `0003` and `0004` of the schema migration
//! chain returned by [`default_chain`].

pub mod mapping;
pub mod phase1;
pub mod phase2;
pub mod phase3;
pub mod rollback;
pub mod status;

use clm_common::config::MigrationSettings;
use clm_common::db::{InitialSchema, MigrationRunner, MigrationStep, TeamLeagueMemberships};
use clm_common::Result;

/// The full schema migration chain, oldest first
pub fn default_chain(settings: &MigrationSettings) -> Result<MigrationRunner> {
    let steps: Vec<Box<dyn MigrationStep>> = vec![
        Box::new(InitialSchema),
        Box::new(TeamLeagueMemberships {
            season_start_year: settings.season_start_year,
        }),
        Box::new(phase1::FirebaseIdentityColumns),
        Box::new(phase3::FirebaseIdentityConstraints {
            email_policy: settings.email_policy,
        }),
    ];
    MigrationRunner::new(steps)
}
