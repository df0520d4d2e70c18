//! Bring a raw profile of any supported format version up to [`GECKO_PROFILE_VERSION`].
//!
//! Every version has exactly one entry in [`UPGRADERS`]. An entry is applied to the root document
//! and then, by the same code path, to each document in its `processes` list, after which the
//! document's `meta.version` is set to the entry's version.

use crate::error::ProcessError;
use crate::gecko::GECKO_PROFILE_VERSION;
use serde_json::Value;

mod steps;

type UpgradeFn = fn(&mut Value) -> Result<(), ProcessError>;

#[derive(Clone, Copy)]
pub enum Upgrader {
    /// No conversion from the previous version exists.
    NotSupported(&'static str),
    /// The version only added data whose absence reads as empty.
    NoMigration(&'static str),
    Upgrade(UpgradeFn),
}

use Upgrader::*;

/// `UPGRADERS[v - 1]` moves a document from version `v - 1` to `v`.
pub static UPGRADERS: [Upgrader; GECKO_PROFILE_VERSION as usize] = [
    NotSupported("profiles without a version number are too old to convert"),
    NotSupported("version 1 profiles are too old to convert"),
    NotSupported("version 2 profiles are too old to convert"),
    Upgrade(steps::v4),
    Upgrade(steps::v5),
    Upgrade(steps::v6),
    Upgrade(steps::v7),
    Upgrade(steps::v8),
    Upgrade(steps::v9),
    NoMigration("pages list added"),
    NoMigration("frame column added"),
    NoMigration("thread pausedRanges added"),
    Upgrade(steps::v13),
    Upgrade(steps::v14),
    Upgrade(steps::v15),
    NoMigration("counters added"),
    NoMigration("meta.shutdownTime added"),
    NoMigration("meta.extensions added"),
    Upgrade(steps::v19),
    Upgrade(steps::v20),
    NoMigration("allocation marker payloads added"),
    Upgrade(steps::v22),
    NoMigration("samples threadCPUDelta added"),
    NoMigration("frame innerWindowID added"),
    Upgrade(steps::v25),
    NoMigration("meta.sampleUnits added"),
    Upgrade(steps::v27),
    NoMigration("unique-string marker schema format added"),
    NoMigration("sanitized-string marker schema format added"),
    NoMigration("pages isPrivateBrowsing added"),
    NoMigration("flow-id marker schema formats added"),
];

/// Read `meta.version`, treating an absent version as 0.
pub fn profile_version(profile: &Value) -> Result<u64, ProcessError> {
    let meta = profile.get("meta").ok_or(ProcessError::MissingMeta)?;
    match meta.get("version") {
        None | Some(Value::Null) => Ok(0),
        Some(version) => version
            .as_u64()
            .ok_or_else(|| ProcessError::InvalidVersion(version.clone())),
    }
}

/// Upgrade `profile` in place. A profile already at the current version is left untouched.
pub fn upgrade_gecko_profile(profile: &mut Value) -> Result<(), ProcessError> {
    let version = profile_version(profile)?;
    if version == GECKO_PROFILE_VERSION {
        return Ok(());
    }
    if version > GECKO_PROFILE_VERSION {
        return Err(ProcessError::VersionTooNew {
            version,
            current: GECKO_PROFILE_VERSION,
        });
    }

    log::debug!("upgrading profile from version {version} to {GECKO_PROFILE_VERSION}");
    for target in version + 1..=GECKO_PROFILE_VERSION {
        apply(target, UPGRADERS[target as usize - 1], profile)?;
    }
    Ok(())
}

fn apply(version: u64, upgrader: Upgrader, doc: &mut Value) -> Result<(), ProcessError> {
    match upgrader {
        NotSupported(reason) => return Err(ProcessError::UnsupportedVersion { version, reason }),
        NoMigration(_) => (),
        Upgrade(step) => step(doc)?,
    }
    doc.get_mut("meta")
        .and_then(Value::as_object_mut)
        .ok_or(ProcessError::MissingMeta)?
        .insert("version".into(), version.into());

    for subprocess in doc
        .get_mut("processes")
        .and_then(Value::as_array_mut)
        .into_iter()
        .flatten()
    {
        apply(version, upgrader, subprocess)?;
    }
    Ok(())
}
