//! Host filesystem layout.
//!
//! Every path the provisioner reads or writes is derived from `InstallPaths`.
//! `InstallPaths::system()` is the production layout; `InstallPaths::under()`
//! re-roots the same layout below a prefix so tests can run against a temp dir.

use std::path::{Path, PathBuf};

/// Compose manifest file name inside the installation directory
pub const MANIFEST_FILE: &str = "docker-compose.yml";
/// Environment file name inside the installation directory
pub const ENV_FILE: &str = ".env";
/// Database bootstrap script name inside the installation directory
pub const DB_INIT_FILE: &str = "init-data.sh";
/// Persistent n8n storage (bind-mounted into main and workers)
pub const DATA_DIR: &str = "n8n_data";
/// Files shared with workflows (bind-mounted at /files)
pub const LOCAL_FILES_DIR: &str = "local-files";
/// Installer settings as used for this installation
pub const SETTINGS_FILE: &str = "provision.json";

/// Resolved host paths
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallPaths {
    root: PathBuf,
    install_dir: PathBuf,
    backup_dir: PathBuf,
}

impl InstallPaths {
    /// Production layout rooted at `/`
    pub fn system() -> Self {
        Self::under("/")
    }

    /// Same layout rooted under `root`
    pub fn under(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        Self {
            install_dir: root.join("opt/n8n"),
            backup_dir: root.join("opt/n8n/backups"),
            root,
        }
    }

    /// Override the installation directory (absolute paths are re-rooted)
    pub fn with_install_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.install_dir = self.rooted(dir.as_ref());
        self.backup_dir = self.install_dir.join("backups");
        self
    }

    /// Override the backup directory (absolute paths are re-rooted)
    pub fn with_backup_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.backup_dir = self.rooted(dir.as_ref());
        self
    }

    fn rooted(&self, path: &Path) -> PathBuf {
        match path.strip_prefix("/") {
            Ok(rel) => self.root.join(rel),
            Err(_) => self.root.join(path),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn install_dir(&self) -> &Path {
        &self.install_dir
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    pub fn env_file(&self) -> PathBuf {
        self.install_dir.join(ENV_FILE)
    }

    pub fn manifest_file(&self) -> PathBuf {
        self.install_dir.join(MANIFEST_FILE)
    }

    pub fn db_init_script(&self) -> PathBuf {
        self.install_dir.join(DB_INIT_FILE)
    }

    pub fn settings_file(&self) -> PathBuf {
        self.install_dir.join(SETTINGS_FILE)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.install_dir.join(DATA_DIR)
    }

    pub fn local_files_dir(&self) -> PathBuf {
        self.install_dir.join(LOCAL_FILES_DIR)
    }

    pub fn os_release(&self) -> PathBuf {
        self.root.join("etc/os-release")
    }

    pub fn meminfo(&self) -> PathBuf {
        self.root.join("proc/meminfo")
    }

    pub fn nginx_site(&self) -> PathBuf {
        self.root.join("etc/nginx/sites-available/n8n")
    }

    pub fn nginx_site_link(&self) -> PathBuf {
        self.root.join("etc/nginx/sites-enabled/n8n")
    }

    pub fn nginx_default_site_link(&self) -> PathBuf {
        self.root.join("etc/nginx/sites-enabled/default")
    }

    /// Static directory served for HTTP-01 challenges
    pub fn acme_webroot(&self) -> PathBuf {
        self.root.join("var/www/certbot")
    }

    pub fn letsencrypt_dir(&self) -> PathBuf {
        self.root.join("etc/letsencrypt")
    }

    pub fn certificate_dir(&self, domain: &str) -> PathBuf {
        self.letsencrypt_dir().join("live").join(domain)
    }

    pub fn fullchain(&self, domain: &str) -> PathBuf {
        self.certificate_dir(domain).join("fullchain.pem")
    }

    pub fn privkey(&self, domain: &str) -> PathBuf {
        self.certificate_dir(domain).join("privkey.pem")
    }

    pub fn ssl_options(&self) -> PathBuf {
        self.letsencrypt_dir().join("options-ssl-nginx.conf")
    }

    pub fn dhparam(&self) -> PathBuf {
        self.letsencrypt_dir().join("ssl-dhparams.pem")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("var/log")
    }

    /// Installed copy of this binary, referenced by scheduled jobs
    pub fn helper_binary(&self) -> PathBuf {
        self.root.join("usr/local/bin/n8n-provision")
    }

    /// Path as it appears on the real host (strips the test root)
    pub fn host_view(&self, path: &Path) -> PathBuf {
        match path.strip_prefix(&self.root) {
            Ok(rel) => Path::new("/").join(rel),
            Err(_) => path.to_path_buf(),
        }
    }
}

impl Default for InstallPaths {
    fn default() -> Self {
        Self::system()
    }
}
