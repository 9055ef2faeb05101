//! The closed property policy for the generic set verb.
//!
//! Only two native properties may be changed this way; everything else
//! native (mountpoint included) goes through dedicated paths outside this
//! crate. User properties (`namespace:name`) are always fair game on a live
//! dataset.

use super::dataset::PropertySource;
use super::{BOOTFS_PROP, CANMOUNT_PROP, Error};

/// Native properties the generic set verb is allowed to touch.
const SETTABLE_NATIVES: [&str; 2] = [BOOTFS_PROP, CANMOUNT_PROP];

/// True for `namespace:name` user properties.
pub(crate) fn is_user_property(name: &str) -> bool {
    name.contains(':')
}

/// The empty value is the clear sentinel: the property reverts to
/// inheritance, or is removed entirely for user properties.
pub(crate) fn clears(value: &str) -> bool {
    value.is_empty()
}

/// Reject property names outside the closed set.
pub(crate) fn ensure_settable(name: &str, dataset: &str) -> Result<(), Error> {
    if SETTABLE_NATIVES.contains(&name) || is_user_property(name) {
        Ok(())
    } else {
        Err(Error::property_policy(
            name,
            dataset,
            "not an authorized property",
        ))
    }
}

/// Reject values outside the legal set for the authorized natives.
pub(crate) fn ensure_legal_value(name: &str, value: &str, dataset: &str) -> Result<(), Error> {
    if clears(value) || is_user_property(name) {
        return Ok(());
    }
    let legal: &[&str] = match name {
        CANMOUNT_PROP => &["on", "off", "noauto"],
        BOOTFS_PROP => &["yes", "no"],
        _ => return Ok(()),
    };
    if legal.contains(&value) {
        Ok(())
    } else {
        Err(Error::property_policy(
            name,
            dataset,
            format!("'{value}' isn't a legal value"),
        ))
    }
}

/// An inherited property only becomes local under `force`.
pub(crate) fn ensure_overridable(
    name: &str,
    dataset: &str,
    source: &PropertySource,
    force: bool,
) -> Result<(), Error> {
    match source {
        PropertySource::Inherited(origin) if !force => Err(Error::property_policy(
            name,
            dataset,
            format!("inherited from '{origin}' (set force to override)"),
        )),
        _ => Ok(()),
    }
}
