//! Structured parsing of the integrity tool's textual format report.
//!
//! The report labels its fields as `<label>:<padding>\t<value>`, e.g.
//!
//! ```text
//! Salt:            	e48da609...
//! Root hash:      	9e7a1d71...
//! ```
//!
//! Matching is structural, not positional: the text before the first tab,
//! right-trimmed, must equal the label, and each label must appear exactly
//! once anywhere in the report. Trailing informational lines are ignored.
//! The label text itself is tool-defined and not version-checked; a drift
//! in the tool's output surfaces as a parse error quoting the full report.

use crate::errors::ProvisioningError;
use crate::options::ProvisionOptions;

use super::HashTreeRecord;

const SALT_LABEL: &str = "Salt:";
const ROOT_HASH_LABEL: &str = "Root hash:";

pub(super) fn parse(
    report: &str,
    options: &ProvisionOptions,
) -> Result<HashTreeRecord, ProvisioningError> {
    let salt = labeled_field(report, SALT_LABEL)?;
    let root_hash = labeled_field(report, ROOT_HASH_LABEL)?;

    require_hex(SALT_LABEL, &salt)?;
    require_hex(ROOT_HASH_LABEL, &root_hash)?;

    let expected = options.hash_algorithm.digest_hex_len();
    if root_hash.len() != expected {
        return Err(ProvisioningError::DigestLength {
            algorithm: options.hash_algorithm.name(),
            actual: root_hash.len(),
            expected,
        });
    }

    Ok(HashTreeRecord {
        salt,
        root_hash,
        block_size: options.block_size,
    })
}

/// Locate `label` in the report, requiring exactly one occurrence.
fn labeled_field(report: &str, label: &'static str) -> Result<String, ProvisioningError> {
    let mut values = report.lines().filter_map(|line| {
        let (head, value) = line.split_once('\t')?;
        (head.trim_end() == label).then(|| value.trim().to_string())
    });

    let Some(value) = values.next() else {
        return Err(ProvisioningError::MissingField {
            label,
            report: report.to_string(),
        });
    };

    let extra = values.count();
    if extra > 0 {
        return Err(ProvisioningError::AmbiguousField {
            label,
            count: extra + 1,
            report: report.to_string(),
        });
    }

    if value.is_empty() {
        return Err(ProvisioningError::EmptyField { label });
    }
    Ok(value)
}

fn require_hex(label: &'static str, value: &str) -> Result<(), ProvisioningError> {
    hex::decode(value).map_err(|_| ProvisioningError::NotHex {
        label,
        value: value.to_string(),
    })?;
    Ok(())
}
