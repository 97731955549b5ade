//! Install-source classification.
//!
//! Resolves a package's installer through the capability layer and maps it
//! onto the closed [`InstallSource`] set. The APK path decides `System`
//! before the installer is consulted, because preinstalled packages report
//! no installer at all.

use std::collections::HashMap;
use std::sync::OnceLock;

use tracing::warn;

use crate::caps::Capabilities;
use crate::types::InstallSource;

/// Known installer packages and the sources they map to.
fn store_packages() -> &'static HashMap<&'static str, InstallSource> {
    static TABLE: OnceLock<HashMap<&'static str, InstallSource>> = OnceLock::new();
    TABLE.get_or_init(|| {
        HashMap::from([
            ("com.android.vending", InstallSource::PlayStore),
            ("com.sec.android.app.samsungapps", InstallSource::GalaxyStore),
            ("com.xiaomi.mipicks", InstallSource::XiaomiStore),
            ("com.xiaomi.market", InstallSource::XiaomiStore),
            ("com.huawei.appmarket", InstallSource::HuaweiStore),
            ("com.amazon.venezia", InstallSource::AmazonStore),
            ("org.fdroid.fdroid", InstallSource::Fdroid),
            // The platform package installer fronts manual APK installs.
            ("com.google.android.packageinstaller", InstallSource::Sideload),
            // `adb install` attributes the shell.
            ("com.android.shell", InstallSource::Adb),
        ])
    })
}

/// Classify a package's install source.
///
/// Query failures degrade to `Unknown` rather than failing registration;
/// the package still gets a record, just a conservative one.
pub async fn classify(caps: &dyn Capabilities, package: &str) -> InstallSource {
    match caps.path_of(package).await {
        Ok(path) => {
            if ["/system/", "/product/", "/vendor/"]
                .iter()
                .any(|prefix| path.contains(prefix))
            {
                return InstallSource::System;
            }
        }
        Err(e) => {
            warn!(package, error = %e, "path lookup failed during classification");
        }
    }

    let installer = match caps.installer_of(package).await {
        Ok(installer) => installer,
        Err(e) => {
            warn!(package, error = %e, "installer lookup failed during classification");
            return InstallSource::Unknown;
        }
    };

    if installer.is_empty() {
        return InstallSource::Sideload;
    }

    store_packages()
        .get(installer.as_str())
        .copied()
        .unwrap_or(InstallSource::Unknown)
}
