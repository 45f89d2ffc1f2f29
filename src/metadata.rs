//! Package attributes recorded after a successful run.

use chrono::{DateTime, TimeZone};
use tracing::info;

use crate::config::{BuildContext, PackageAttributes};

/// Version attribute identifying the provisioner that built the image.
pub const PROVISIONER_VERSION: &str = "puppet";

/// Timestamp layout of the release attribute (`YYYYMMDDhhmm`).
pub const RELEASE_FORMAT: &str = "%Y%m%d%H%M";

/// Records `name`, `version` and `release` on the build context.
///
/// `release` is `now` formatted in its own time zone, so callers pass
/// `chrono::Local::now()` to stamp images with the local build time.
pub fn record_package_metadata<Tz>(context: &mut BuildContext, now: DateTime<Tz>)
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    let attributes = PackageAttributes {
        name: context.package.arg.clone(),
        version: PROVISIONER_VERSION.to_string(),
        release: now.format(RELEASE_FORMAT).to_string(),
    };
    info!(
        "recording package attributes: name={}, version={}, release={}",
        attributes.name, attributes.version, attributes.release
    );
    context.package.attributes = Some(attributes);
}
