use clap::Parser;
use etcd_coord_core::KeyRange;

#[derive(Debug, Parser)]
pub struct Options {
    /// etcd endpoints to connect to.
    #[clap(long, default_value = "http://127.0.0.1:2379", value_delimiter = ',')]
    pub endpoints: Vec<String>,

    /// Key to announce under a lease for as long as this process runs.
    #[clap(long)]
    pub key: Option<String>,
    /// Value to store at the announced key.
    #[clap(long, default_value = "")]
    pub value: String,
    /// Lease ttl, in seconds.
    #[clap(long, default_value = "10")]
    pub ttl: i64,

    /// Key to watch, logging every change.
    #[clap(long)]
    pub watch: Option<String>,
    /// Watch every key starting with the watched key.
    #[clap(long)]
    pub prefix: bool,

    /// Filter logs using this string, rather than the `RUST_LOG` environment variable.
    #[clap(long)]
    pub log_filter: Option<String>,

    /// Don't print logs with colour.
    #[clap(long)]
    pub no_colour: bool,
}

impl Options {
    pub fn watch_range(&self) -> KeyRange {
        if self.prefix {
            KeyRange::Prefix
        } else {
            KeyRange::Single
        }
    }
}

impl Default for Options {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://127.0.0.1:2379".to_owned()],
            key: None,
            value: String::new(),
            ttl: 10,
            watch: None,
            prefix: false,
            log_filter: None,
            no_colour: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_match_parser() {
        let parsed = Options::parse_from(["etcd-coord"]);
        let default = Options::default();
        assert_eq!(parsed.endpoints, default.endpoints);
        assert_eq!(parsed.ttl, default.ttl);
        assert_eq!(parsed.value, default.value);
        assert_eq!(parsed.watch_range(), KeyRange::Single);
    }

    #[test]
    fn parses_announce_and_watch() {
        let parsed = Options::parse_from([
            "etcd-coord",
            "--endpoints",
            "http://10.0.0.1:2379,http://10.0.0.2:2379",
            "--key",
            "members/a",
            "--value",
            "10.0.0.1:8080",
            "--ttl",
            "5",
            "--watch",
            "members/",
            "--prefix",
        ]);
        assert_eq!(
            parsed.endpoints,
            vec!["http://10.0.0.1:2379", "http://10.0.0.2:2379"]
        );
        assert_eq!(parsed.key.as_deref(), Some("members/a"));
        assert_eq!(parsed.value, "10.0.0.1:8080");
        assert_eq!(parsed.ttl, 5);
        assert_eq!(parsed.watch.as_deref(), Some("members/"));
        assert_eq!(parsed.watch_range(), KeyRange::Prefix);
    }
}
