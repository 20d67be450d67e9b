//! nginx configuration model.
//!
//! Configurations are built as a tree of `Node`s and rendered by one
//! serializer that owns quoting and indentation. Two site configurations
//! exist: the challenge responder used while a certificate is requested, and
//! the production TLS site.

use std::fmt::Write as _;
use std::path::PathBuf;
use strum::{Display, EnumString};

/// One element of an nginx configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    /// `name args...;`
    Directive { name: String, args: Vec<String> },
    /// `name args... { children }`
    Block {
        name: String,
        args: Vec<String>,
        children: Vec<Node>,
    },
    /// `# text`
    Comment(String),
}

/// `name args...;`
pub fn directive<I, S>(name: &str, args: I) -> Node
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    Node::Directive {
        name: name.to_string(),
        args: args.into_iter().map(Into::into).collect(),
    }
}

/// `name args... { children }`
pub fn block<I, S>(name: &str, args: I, children: Vec<Node>) -> Node
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    Node::Block {
        name: name.to_string(),
        args: args.into_iter().map(Into::into).collect(),
        children,
    }
}

/// Which site configuration is installed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum ProxyState {
    /// Port 80 only, serves ACME challenges, 404 otherwise
    #[strum(serialize = "challenge")]
    Challenge,
    /// HTTPS site with the full routing rules
    #[strum(serialize = "production")]
    Production,
}

const STATE_MARKER: &str = "n8n-provision proxy-state:";

impl ProxyState {
    /// Read the state marker from an installed site file
    pub fn detect(content: &str) -> Option<Self> {
        content.lines().find_map(|line| {
            line.trim()
                .strip_prefix('#')
                .map(str::trim)
                .and_then(|l| l.strip_prefix(STATE_MARKER))
                .and_then(|state| state.trim().parse().ok())
        })
    }
}

/// A complete configuration file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NginxConfig {
    pub state: ProxyState,
    pub nodes: Vec<Node>,
}

impl NginxConfig {
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Generated by n8n-provision.");
        let _ = writeln!(out, "# {} {}", STATE_MARKER, self.state);
        let mut previous_was_block = false;
        for node in &self.nodes {
            let is_block = matches!(node, Node::Block { .. });
            if is_block || previous_was_block {
                out.push('\n');
            }
            render_node(&mut out, node, 0);
            previous_was_block = is_block;
        }
        out
    }
}

fn render_node(out: &mut String, node: &Node, depth: usize) {
    let indent = "    ".repeat(depth);
    match node {
        Node::Directive { name, args } => {
            let _ = writeln!(out, "{}{};", indent, head(name, args));
        }
        Node::Block {
            name,
            args,
            children,
        } => {
            let _ = writeln!(out, "{}{} {{", indent, head(name, args));
            for child in children {
                render_node(out, child, depth + 1);
            }
            let _ = writeln!(out, "{}}}", indent);
        }
        Node::Comment(text) => {
            let _ = writeln!(out, "{}# {}", indent, text);
        }
    }
}

fn head(name: &str, args: &[String]) -> String {
    let mut parts = vec![name.to_string()];
    parts.extend(args.iter().map(|a| quote(a)));
    parts.join(" ")
}

/// Quote an argument when nginx would otherwise split or terminate it
fn quote(arg: &str) -> String {
    let needs_quotes = arg.is_empty()
        || arg
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, ';' | '{' | '}' | '"' | '\'' | '#'));
    if needs_quotes {
        format!("\"{}\"", arg.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        arg.to_string()
    }
}

// ============================================================================
// Site definitions
// ============================================================================

const ACME_PATH: &str = "/.well-known/acme-challenge/";
const UPSTREAM: &str = "n8n_backend";
const STATIC_ASSETS: &str = r"\.(js|css|png|jpg|jpeg|gif|ico|svg|woff|woff2|ttf|map)$";
const API_PATHS: &str = "^/(api|rest|webhook|webhook-test|webhook-waiting|form|form-test)/";

/// Request rate-limit zone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateZone {
    pub name: &'static str,
    pub rate_per_sec: u32,
    pub burst: u32,
}

pub const ZONE_DEFAULT: RateZone = RateZone {
    name: "n8n_default",
    rate_per_sec: 10,
    burst: 20,
};
pub const ZONE_API: RateZone = RateZone {
    name: "n8n_api",
    rate_per_sec: 30,
    burst: 50,
};
pub const ZONE_BINARY: RateZone = RateZone {
    name: "n8n_binary",
    rate_per_sec: 50,
    burst: 100,
};

/// Inputs of the production site. Paths are as seen on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySite {
    pub domain: String,
    pub upstream_port: u16,
    pub payload_max_mib: u32,
    pub webroot: PathBuf,
    pub fullchain: PathBuf,
    pub privkey: PathBuf,
    pub ssl_options: PathBuf,
    pub dhparam: PathBuf,
}

fn acme_location(webroot: &str) -> Node {
    block(
        "location",
        ["^~", ACME_PATH],
        vec![
            directive("root", [webroot]),
            directive("default_type", ["text/plain"]),
        ],
    )
}

/// Port 80 responder for HTTP-01 challenges
pub fn challenge_config(domain: &str, webroot: &std::path::Path) -> NginxConfig {
    let webroot = webroot.display().to_string();
    NginxConfig {
        state: ProxyState::Challenge,
        nodes: vec![block(
            "server",
            Vec::<String>::new(),
            vec![
                directive("listen", ["80"]),
                directive("listen", ["[::]:80"]),
                directive("server_name", [domain]),
                acme_location(&webroot),
                block("location", ["/"], vec![directive("return", ["404"])]),
            ],
        )],
    }
}

fn security_headers() -> Vec<Node> {
    vec![
        directive(
            "add_header",
            ["Strict-Transport-Security", "max-age=31536000; includeSubDomains", "always"],
        ),
        directive("add_header", ["X-Frame-Options", "SAMEORIGIN", "always"]),
        directive("add_header", ["X-Content-Type-Options", "nosniff", "always"]),
        directive(
            "add_header",
            ["Referrer-Policy", "strict-origin-when-cross-origin", "always"],
        ),
    ]
}

/// Headers and upstream shared by every proxied location.
///
/// `proxy_set_header` in a location replaces the inherited set, so each
/// location carries the full list.
fn proxy_to_upstream(timeout_secs: u32) -> Vec<Node> {
    let timeout = format!("{}s", timeout_secs);
    vec![
        directive("proxy_pass", [format!("http://{}", UPSTREAM)]),
        directive("proxy_http_version", ["1.1"]),
        directive("proxy_set_header", ["Host", "$host"]),
        directive("proxy_set_header", ["X-Real-IP", "$remote_addr"]),
        directive("proxy_set_header", ["X-Forwarded-For", "$proxy_add_x_forwarded_for"]),
        directive("proxy_set_header", ["X-Forwarded-Proto", "$scheme"]),
        directive("proxy_set_header", ["Upgrade", "$http_upgrade"]),
        directive("proxy_set_header", ["Connection", "$connection_upgrade"]),
        directive("proxy_connect_timeout", ["10s"]),
        directive("proxy_send_timeout", [timeout.as_str()]),
        directive("proxy_read_timeout", [timeout.as_str()]),
    ]
}

fn limit(zone: RateZone) -> Node {
    directive(
        "limit_req",
        [
            format!("zone={}", zone.name),
            format!("burst={}", zone.burst),
            "nodelay".to_string(),
        ],
    )
}

fn rate_zone(zone: RateZone) -> Node {
    directive(
        "limit_req_zone",
        [
            "$binary_remote_addr".to_string(),
            format!("zone={}:10m", zone.name),
            format!("rate={}r/s", zone.rate_per_sec),
        ],
    )
}

/// HTTPS site with path-based routing
pub fn production_config(site: &ProxySite) -> NginxConfig {
    let webroot = site.webroot.display().to_string();

    let push = {
        let mut children = proxy_to_upstream(3600);
        children.extend([
            directive("proxy_buffering", ["off"]),
            directive("proxy_cache", ["off"]),
            directive("proxy_ignore_client_abort", ["on"]),
        ]);
        block("location", ["^~", "/rest/push"], children)
    };

    let binary = {
        let mut children = vec![limit(ZONE_BINARY)];
        children.extend(proxy_to_upstream(300));
        children.extend([
            directive("proxy_request_buffering", ["off"]),
            directive("proxy_buffering", ["off"]),
        ]);
        block("location", ["^~", "/rest/binary-data"], children)
    };

    let assets = {
        let mut children = proxy_to_upstream(60);
        children.push(directive("expires", ["1y"]));
        children.push(directive("add_header", ["Cache-Control", "public, immutable"]));
        // a location-level add_header drops the server-level ones
        children.extend(security_headers());
        block("location", ["~*", STATIC_ASSETS], children)
    };

    let api = {
        let mut children = vec![limit(ZONE_API)];
        children.extend(proxy_to_upstream(300));
        block("location", ["~", API_PATHS], children)
    };

    let default = {
        let mut children = vec![limit(ZONE_DEFAULT)];
        children.extend(proxy_to_upstream(60));
        block("location", ["/"], children)
    };

    let mut tls_server = vec![
        directive("listen", ["443", "ssl", "http2"]),
        directive("listen", ["[::]:443", "ssl", "http2"]),
        directive("server_name", [site.domain.as_str()]),
        Node::Comment("TLS".to_string()),
        directive("ssl_certificate", [site.fullchain.display().to_string()]),
        directive("ssl_certificate_key", [site.privkey.display().to_string()]),
        directive("include", [site.ssl_options.display().to_string()]),
        directive("ssl_dhparam", [site.dhparam.display().to_string()]),
        directive("client_max_body_size", [format!("{}m", site.payload_max_mib)]),
    ];
    tls_server.extend(security_headers());
    tls_server.extend([push, binary, assets, api, default]);

    NginxConfig {
        state: ProxyState::Production,
        nodes: vec![
            rate_zone(ZONE_DEFAULT),
            rate_zone(ZONE_API),
            rate_zone(ZONE_BINARY),
            block(
                "map",
                ["$http_upgrade", "$connection_upgrade"],
                vec![directive("default", ["upgrade"]), directive("\"\"", ["close"])],
            ),
            block(
                "upstream",
                [UPSTREAM],
                vec![
                    directive("server", [format!("127.0.0.1:{}", site.upstream_port)]),
                    directive("keepalive", ["32"]),
                ],
            ),
            block(
                "server",
                Vec::<String>::new(),
                vec![
                    directive("listen", ["80"]),
                    directive("listen", ["[::]:80"]),
                    directive("server_name", [site.domain.as_str()]),
                    acme_location(&webroot),
                    block(
                        "location",
                        ["/"],
                        vec![directive("return", ["301", "https://$host$request_uri"])],
                    ),
                ],
            ),
            block("server", Vec::<String>::new(), tls_server),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn site() -> ProxySite {
        ProxySite {
            domain: "n8n.example.com".to_string(),
            upstream_port: 5678,
            payload_max_mib: 16,
            webroot: PathBuf::from("/var/www/certbot"),
            fullchain: PathBuf::from("/etc/letsencrypt/live/n8n.example.com/fullchain.pem"),
            privkey: PathBuf::from("/etc/letsencrypt/live/n8n.example.com/privkey.pem"),
            ssl_options: PathBuf::from("/etc/letsencrypt/options-ssl-nginx.conf"),
            dhparam: PathBuf::from("/etc/letsencrypt/ssl-dhparams.pem"),
        }
    }

    #[test]
    fn test_quoting() {
        assert_eq!(quote("plain"), "plain");
        assert_eq!(quote("public, immutable"), "\"public, immutable\"");
        assert_eq!(quote("a;b"), "\"a;b\"");
        assert_eq!(quote(""), "\"\"");
        assert_eq!(quote(STATIC_ASSETS), STATIC_ASSETS);
    }

    #[test]
    fn test_render_nesting() {
        let config = NginxConfig {
            state: ProxyState::Challenge,
            nodes: vec![block(
                "server",
                Vec::<String>::new(),
                vec![directive("listen", ["80"])],
            )],
        };
        let text = config.render();
        assert!(text.contains("server {\n    listen 80;\n}\n"));
    }

    #[test]
    fn test_challenge_config() {
        let text = challenge_config("n8n.example.com", Path::new("/var/www/certbot")).render();
        assert!(text.contains("listen 80;"));
        assert!(text.contains("location ^~ /.well-known/acme-challenge/ {"));
        assert!(text.contains("root /var/www/certbot;"));
        assert!(text.contains("return 404;"));
        assert!(!text.contains("443"));
        assert_eq!(ProxyState::detect(&text), Some(ProxyState::Challenge));
    }

    #[test]
    fn test_production_routing_rules() {
        let text = production_config(&site()).render();
        assert_eq!(ProxyState::detect(&text), Some(ProxyState::Production));
        assert!(text.contains("limit_req_zone $binary_remote_addr zone=n8n_api:10m rate=30r/s;"));
        assert!(text.contains("return 301 https://$host$request_uri;"));
        assert!(text.contains("location ^~ /rest/push {"));
        assert!(text.contains("proxy_ignore_client_abort on;"));
        assert!(text.contains("proxy_read_timeout 3600s;"));
        assert!(text.contains("limit_req zone=n8n_binary burst=100 nodelay;"));
        assert!(text.contains("proxy_request_buffering off;"));
        assert!(text.contains("add_header Cache-Control \"public, immutable\";"));
        assert!(text.contains(&format!("location ~ {} {{", API_PATHS)));
        assert!(text.contains("limit_req zone=n8n_default burst=20 nodelay;"));
        assert!(text.contains("client_max_body_size 16m;"));
        assert!(text.contains(
            "add_header Strict-Transport-Security \"max-age=31536000; includeSubDomains\" always;"
        ));
        assert!(text.contains("\"\" close;"));
        assert!(text.contains("server 127.0.0.1:5678;"));
    }

    #[test]
    fn test_push_location_is_not_rate_limited() {
        let config = production_config(&site());
        let Some(Node::Block { children, .. }) = config.nodes.last() else {
            panic!("tls server missing");
        };
        let push = children
            .iter()
            .find(|n| matches!(n, Node::Block { args, .. } if args.iter().any(|a| a == "/rest/push")))
            .unwrap();
        let Node::Block { children, .. } = push else {
            unreachable!()
        };
        assert!(!children
            .iter()
            .any(|n| matches!(n, Node::Directive { name, .. } if name == "limit_req")));
    }

    #[test]
    fn test_detect_unknown() {
        assert_eq!(ProxyState::detect("server {}"), None);
    }
}
