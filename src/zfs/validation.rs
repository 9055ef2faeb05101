use super::Error;

/// Validates a single path component (a dataset name segment, a snapshot
/// short name, or a clone suffix) against ZFS naming rules.
pub(crate) fn validate_component(component: &str, what: &str) -> Result<(), Error> {
    // ZFS component names must match something like the regular expression
    // [a-zA-Z0-9][a-zA-Z0-9-_:.]*. Path separators and '@' are structural
    // and never belong inside a component.

    if component.is_empty() {
        return Err(Error::invalid(component, format!("{what} can't be empty")));
    }

    let first_char = component.chars().next().unwrap();
    if !first_char.is_ascii_alphanumeric() {
        return Err(Error::invalid(
            component,
            format!("{what} can't begin with '{first_char}'"),
        ));
    }

    for c in component.chars() {
        if !c.is_ascii_alphanumeric() && c != '.' && c != '-' && c != '_' && c != ':' {
            return Err(Error::invalid(
                component,
                format!("invalid character '{c}' in {what}"),
            ));
        }
    }

    Ok(())
}

/// Validates a full dataset path, with at most one `@` separating an
/// optional snapshot short name.
pub(crate) fn validate_dataset_name(name: &str) -> Result<(), Error> {
    if name.len() > 255 {
        return Err(Error::invalid(name, "name too long"));
    }

    let (path, snapshot) = match name.split_once('@') {
        Some((path, snapshot)) => (path, Some(snapshot)),
        None => (name, None),
    };

    if path.is_empty() {
        return Err(Error::invalid(name, "dataset path can't be empty"));
    }
    for segment in path.split('/') {
        validate_component(segment, "dataset name component")?;
    }

    if let Some(snapshot) = snapshot {
        if snapshot.contains('@') {
            return Err(Error::invalid(name, "more than one '@' in name"));
        }
        validate_component(snapshot, "snapshot name")?;
    }

    Ok(())
}
