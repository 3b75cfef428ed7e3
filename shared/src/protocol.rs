/// Config file read by `mdns-responderd` when no path is given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/mdns-responderd/responderd.toml";

/// Browsing this type enumerates every service type on the link.
pub const META_SERVICE_TYPE: &str = mdns_core::SERVICE_TYPE_ENUMERATION;

/// Default `RUST_LOG` directive for a binary named `bin`.
pub fn default_log_filter(bin: &str) -> String {
    format!("{}=info,mdns_core=info", bin.replace('-', "_"))
}
