//! Reverse proxy adapter.
//!
//! One server file per environment routes the environment's domain to the
//! ports of its web services. Every write is validated by the proxy and
//! undone when validation fails, so a broken file never stays in place.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{error, info};

use crate::deploy::command::run_checked;
use crate::errors::DeployerError;
use crate::filesys::file::File;
use crate::storage::settings::ProxySettings;

/// Inputs of one environment's server file
#[derive(Debug, Clone)]
pub struct SiteConfig {
    pub project: String,
    pub environment: String,
    pub ports: Vec<u16>,
    pub domain: Option<String>,
    pub ssl_enabled: bool,
    /// Collected static files of the live release
    pub static_root: PathBuf,
    /// Shared uploads of the project
    pub media_root: PathBuf,
}

impl SiteConfig {
    /// `<project>-<environment>`, the file and certificate stem
    pub fn config_name(&self) -> String {
        format!("{}-{}", self.project, self.environment)
    }

    pub fn upstream_name(&self) -> String {
        self.config_name().replace('-', "_")
    }

    pub fn render(&self, cert_dir: &std::path::Path, key_dir: &std::path::Path) -> String {
        let upstream = self.upstream_name();
        let server_name = self
            .domain
            .as_deref()
            .filter(|d| !d.is_empty())
            .unwrap_or("_");

        let mut out = format!("upstream {} {{\n", upstream);
        for port in &self.ports {
            out.push_str(&format!(
                "    server 127.0.0.1:{} max_fails=3 fail_timeout=30s;\n",
                port
            ));
        }
        out.push_str("    keepalive 32;\n}\n\n");

        if self.ssl_enabled {
            let name = self.config_name();
            out.push_str(&format!(
                "server {{
    listen 80;
    server_name {server_name};
    return 301 https://$server_name$request_uri;
}}

server {{
    listen 443 ssl http2;
    server_name {server_name};

    ssl_certificate {cert};
    ssl_certificate_key {key};

    ssl_protocols TLSv1.2 TLSv1.3;
    ssl_ciphers HIGH:!aNULL:!MD5;
    ssl_prefer_server_ciphers on;
",
                cert = cert_dir.join(format!("{}.crt", name)).display(),
                key = key_dir.join(format!("{}.key", name)).display(),
            ));
        } else {
            out.push_str(&format!(
                "server {{
    listen 80;
    server_name {server_name};
"
            ));
        }

        out.push_str(&format!(
            "
    client_max_body_size 100M;

    location / {{
        proxy_pass http://{upstream};
        proxy_http_version 1.1;
        proxy_set_header Connection \"\";
        proxy_set_header Host $host;
        proxy_set_header X-Real-IP $remote_addr;
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
        proxy_set_header X-Forwarded-Proto $scheme;
        proxy_connect_timeout 60s;
        proxy_send_timeout 60s;
        proxy_read_timeout 60s;
    }}

    location /static/ {{
        alias {static_root}/;
        expires 30d;
        add_header Cache-Control \"public, immutable\";
    }}

    location /media/ {{
        alias {media_root}/;
        expires 7d;
    }}

    location /health/ {{
        proxy_pass http://{upstream}/health/;
        access_log off;
    }}
}}
",
            static_root = self.static_root.display(),
            media_root = self.media_root.display(),
        ));
        out
    }
}

#[async_trait]
pub trait ReverseProxy: Send + Sync {
    /// Write and validate the server file of a site, returning its path.
    /// A rejected file is rolled back to its previous content.
    async fn write_config(&self, site: &SiteConfig) -> Result<PathBuf, DeployerError>;

    /// Validate the whole configuration, then apply it
    async fn reload(&self) -> Result<(), DeployerError>;
}

/// [`ReverseProxy`] for nginx
#[derive(Debug, Clone)]
pub struct Nginx {
    settings: ProxySettings,
    timeout: Duration,
}

impl Nginx {
    pub fn new(settings: &ProxySettings) -> Self {
        Self {
            settings: settings.clone(),
            timeout: Duration::from_secs(settings.timeout_secs),
        }
    }

    fn nginx(&self, args: &[&str]) -> (Command, String) {
        let mut cmd = if self.settings.use_sudo {
            let mut cmd = Command::new("sudo");
            cmd.arg(&self.settings.binary);
            cmd
        } else {
            Command::new(&self.settings.binary)
        };
        cmd.args(args);
        (cmd, format!("{} {}", self.settings.binary, args.join(" ")))
    }

    async fn validate(&self) -> Result<(), DeployerError> {
        let (cmd, label) = self.nginx(&["-t"]);
        run_checked(cmd, &label, self.timeout).await?;
        Ok(())
    }
}

#[async_trait]
impl ReverseProxy for Nginx {
    async fn write_config(&self, site: &SiteConfig) -> Result<PathBuf, DeployerError> {
        let path = self
            .settings
            .config_dir
            .join(format!("{}.conf", site.config_name()));
        let file = File::new(&path);
        let previous = file.read_optional().await?;

        let rendered = site.render(&self.settings.cert_dir, &self.settings.key_dir);
        file.write_atomic(rendered.as_bytes()).await?;

        if let Err(err) = self.validate().await {
            error!("Proxy rejected {}: {}", path.display(), err);
            match previous {
                Some(previous) => file.write_atomic(previous.as_bytes()).await?,
                None => file.delete().await?,
            }
            return Err(err);
        }

        info!("Wrote proxy config {}", path.display());
        Ok(path)
    }

    async fn reload(&self) -> Result<(), DeployerError> {
        self.validate().await?;
        let (cmd, label) = self.nginx(&["-s", "reload"]);
        run_checked(cmd, &label, self.timeout).await?;
        info!("Proxy reloaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn site(ssl: bool) -> SiteConfig {
        SiteConfig {
            project: "shop".to_string(),
            environment: "prod".to_string(),
            ports: vec![8000, 8002],
            domain: Some("shop.example.com".to_string()),
            ssl_enabled: ssl,
            static_root: PathBuf::from("/apps/shop/releases/prod/current/staticfiles"),
            media_root: PathBuf::from("/apps/shop/media"),
        }
    }

    #[test]
    fn test_render_plain() {
        let text = site(false).render(Path::new("/certs"), Path::new("/keys"));
        assert!(text.starts_with("upstream shop_prod {\n"));
        assert!(text.contains("    server 127.0.0.1:8000 max_fails=3 fail_timeout=30s;\n"));
        assert!(text.contains("    server 127.0.0.1:8002 max_fails=3 fail_timeout=30s;\n"));
        assert!(text.contains("server_name shop.example.com;"));
        assert!(text.contains("proxy_pass http://shop_prod;"));
        assert!(text.contains("alias /apps/shop/releases/prod/current/staticfiles/;"));
        assert!(text.contains("alias /apps/shop/media/;"));
        assert!(text.contains("proxy_pass http://shop_prod/health/;"));
        assert!(!text.contains("443"));
    }

    #[test]
    fn test_render_ssl() {
        let mut site = site(true);
        site.domain = None;
        let text = site.render(Path::new("/certs"), Path::new("/keys"));
        assert!(text.contains("return 301 https://$server_name$request_uri;"));
        assert!(text.contains("listen 443 ssl http2;"));
        assert!(text.contains("ssl_certificate /certs/shop-prod.crt;"));
        assert!(text.contains("ssl_certificate_key /keys/shop-prod.key;"));
        assert!(text.contains("server_name _;"));
    }

    fn nginx_in(dir: &Path, binary: &str) -> Nginx {
        Nginx::new(&ProxySettings {
            config_dir: dir.join("sites"),
            binary: binary.to_string(),
            use_sudo: false,
            timeout_secs: 5,
            ..ProxySettings::default()
        })
    }

    #[tokio::test]
    async fn test_rejected_config_restores_previous() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sites").join("shop-prod.conf");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "previous").unwrap();

        let err = nginx_in(dir.path(), "false")
            .write_config(&site(false))
            .await
            .unwrap_err();
        assert!(matches!(err, DeployerError::ExternalCommand { .. }));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "previous");
    }

    #[tokio::test]
    async fn test_rejected_new_config_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let result = nginx_in(dir.path(), "false").write_config(&site(false)).await;
        assert!(result.is_err());
        assert!(!dir.path().join("sites").join("shop-prod.conf").exists());
    }

    #[tokio::test]
    async fn test_accepted_config_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = nginx_in(dir.path(), "true")
            .write_config(&site(false))
            .await
            .unwrap();
        let written = std::fs::read_to_string(path).unwrap();
        assert!(written.contains("upstream shop_prod"));
    }
}
