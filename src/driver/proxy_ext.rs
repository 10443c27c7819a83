//! Proxy credential extension
//!
//! Chrome has no flag for proxy credentials; an extension must answer the
//! auth challenge. The bundle here is a pure function of the proxy config:
//! the same config always produces byte-identical files, so the on-disk
//! copy is stable across restarts.

use crate::config::ProxyConfig;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Directory name of the unpacked extension under the artifact root.
pub const EXTENSION_DIR: &str = "proxy_extension";
/// Zipped copy kept alongside it, flat at the artifact root.
pub const EXTENSION_ZIP: &str = "proxy_extension.zip";

fn manifest_json() -> String {
    serde_json::json!({
        "manifest_version": 3,
        "name": "portside proxy auth",
        "version": "1.0",
        "permissions": ["proxy", "webRequest", "webRequestAuthProvider"],
        "host_permissions": ["<all_urls>"],
        "background": { "service_worker": "background.js" }
    })
    .to_string()
}

fn background_js(proxy: &ProxyConfig) -> String {
    format!(
        r#"const config = {{
  mode: "fixed_servers",
  rules: {{
    singleProxy: {{
      scheme: "http",
      host: {host},
      port: {port}
    }},
    bypassList: ["localhost", "127.0.0.1"]
  }}
}};

chrome.proxy.settings.set({{ value: config, scope: "regular" }}, function() {{}});

chrome.webRequest.onAuthRequired.addListener(
  function(details) {{
    return {{
      authCredentials: {{
        username: {username},
        password: {password}
      }}
    }};
  }},
  {{ urls: ["<all_urls>"] }},
  ["blocking"]
);
"#,
        host = serde_json::to_string(&proxy.host).unwrap_or_default(),
        port = proxy.port,
        username = serde_json::to_string(&proxy.username).unwrap_or_default(),
        password = serde_json::to_string(&proxy.password).unwrap_or_default(),
    )
}

/// Write the unpacked extension (what `--load-extension` consumes) and its
/// zipped copy under `root`. Returns the unpacked directory.
pub fn materialize(proxy: &ProxyConfig, root: &Path) -> std::io::Result<PathBuf> {
    let dir = root.join(EXTENSION_DIR);
    std::fs::create_dir_all(&dir)?;

    let manifest = manifest_json();
    let background = background_js(proxy);

    std::fs::write(dir.join("manifest.json"), &manifest)?;
    std::fs::write(dir.join("background.js"), &background)?;

    let zip_file = std::fs::File::create(root.join(EXTENSION_ZIP))?;
    let mut zip = zip::ZipWriter::new(zip_file);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    zip.start_file("manifest.json", options)
        .map_err(std::io::Error::other)?;
    zip.write_all(manifest.as_bytes())?;
    zip.start_file("background.js", options)
        .map_err(std::io::Error::other)?;
    zip.write_all(background.as_bytes())?;
    zip.finish().map_err(std::io::Error::other)?;

    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxy() -> ProxyConfig {
        ProxyConfig {
            host: "proxy.example.com".to_string(),
            port: 3128,
            username: "user".to_string(),
            password: "p\"ss".to_string(),
        }
    }

    #[test]
    fn materialize_writes_unpacked_and_zip() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = materialize(&proxy(), tmp.path()).unwrap();
        assert!(dir.join("manifest.json").is_file());
        assert!(dir.join("background.js").is_file());
        assert!(tmp.path().join(EXTENSION_ZIP).is_file());
    }

    #[test]
    fn output_is_stable_across_runs() {
        let tmp = tempfile::tempdir().unwrap();
        materialize(&proxy(), tmp.path()).unwrap();
        let first = std::fs::read_to_string(tmp.path().join(EXTENSION_DIR).join("background.js"))
            .unwrap();
        materialize(&proxy(), tmp.path()).unwrap();
        let second = std::fs::read_to_string(tmp.path().join(EXTENSION_DIR).join("background.js"))
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn credentials_are_json_escaped() {
        let js = background_js(&proxy());
        assert!(js.contains(r#""p\"ss""#));
        assert!(js.contains(r#""proxy.example.com""#));
    }
}
