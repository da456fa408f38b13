//! Closed command grammar for the admin console.
//!
//! The first line of every frame is space-tokenized and the first token
//! selects a variant. Parsing is total over the closed set: an
//! unrecognized command yields `None`, which the dispatcher drops
//! silently: typos get no feedback by design of the wire protocol.

/// Aggregate-model queries answered as `<name> <result>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    /// Per-document listing.
    Documents,
    /// Total editing sessions.
    ActiveUsersCount,
    /// Total open documents.
    ActiveDocsCount,
    /// Memory sample history.
    MemStats,
    /// CPU sample history.
    CpuStats,
    /// Sent-bytes activity history.
    SentActivity,
    /// Received-bytes activity history.
    RecvActivity,
    /// Connection-count history.
    ConnectionActivity,
}

impl QueryKind {
    /// The wire name, used both for dispatch and the reply prefix.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Documents => "documents",
            Self::ActiveUsersCount => "active_users_count",
            Self::ActiveDocsCount => "active_docs_count",
            Self::MemStats => "mem_stats",
            Self::CpuStats => "cpu_stats",
            Self::SentActivity => "sent_activity",
            Self::RecvActivity => "recv_activity",
            Self::ConnectionActivity => "connection_activity",
        }
    }

    fn parse(token: &str) -> Option<Self> {
        match token {
            "documents" => Some(Self::Documents),
            "active_users_count" => Some(Self::ActiveUsersCount),
            "active_docs_count" => Some(Self::ActiveDocsCount),
            "mem_stats" => Some(Self::MemStats),
            "cpu_stats" => Some(Self::CpuStats),
            "sent_activity" => Some(Self::SentActivity),
            "recv_activity" => Some(Self::RecvActivity),
            "connection_activity" => Some(Self::ConnectionActivity),
            _ => None,
        }
    }
}

/// One parsed console command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    /// `auth jwt=<token>`: authenticate this connection.
    Auth {
        /// The still-URL-encoded bearer token, if present.
        token: Option<String>,
    },
    /// Aggregate-model query.
    Query(QueryKind),
    /// `history`: full history snapshot as JSON.
    History,
    /// `version`: server and engine version strings.
    Version,
    /// `subscribe <chan>+`.
    Subscribe(Vec<String>),
    /// `unsubscribe <chan>+`.
    Unsubscribe(Vec<String>),
    /// `mem_consumed`.
    MemConsumed,
    /// `total_avail_mem`.
    TotalAvailMem,
    /// `sent_bytes`.
    SentBytes,
    /// `recv_bytes`.
    RecvBytes,
    /// `uptime`.
    Uptime,
    /// `log_lines`.
    LogLines,
    /// `kill <pid>`: pid kept as text so dispatch can log parse failures.
    Kill {
        /// The raw pid token.
        pid: String,
    },
    /// `settings`: dump current tunables.
    Settings,
    /// `channel_list`: dump logging verbosity per channel.
    ChannelList,
    /// `shutdown`: request orderly process shutdown.
    Shutdown,
    /// `set k=v ...`.
    Set(Vec<(String, String)>),
    /// `update-log-levels ch=level ...`.
    UpdateLogLevels(Vec<(String, String)>),
    /// `updateroutetoken <json>`.
    UpdateRouteToken {
        /// The serverId-to-token JSON map, verbatim.
        json: String,
    },
    /// `migrate <status> <dockey> <routeToken> <serverId>`.
    Migrate {
        /// Claimed document status (`unsaved`, `saved`, `readonly`).
        status: String,
        /// Target document.
        doc_key: String,
        /// Routing token for the target instance.
        route_token: String,
        /// Target server identifier.
        server_id: String,
    },
    /// `wopiSrcMap`: dump docKey to source-URI map.
    WopiSrcMap,
    /// `verifyauth jwt=<token> id=<id>`: stateless token check.
    VerifyAuth {
        /// The still-URL-encoded bearer token, if present.
        token: Option<String>,
        /// Correlation id echoed in the reply.
        id: String,
    },
    /// `closemonitor`: monitor-side migration handshake complete.
    CloseMonitor,
}

/// Extract `value` from a `key=value` token when `key` matches.
fn token_value(token: &str, key: &str) -> Option<String> {
    let (k, v) = token.split_once('=')?;
    (k == key).then(|| v.to_string())
}

/// Split a token at `=` into a pair; `None` when there is no `=`.
fn key_value(token: &str) -> Option<(String, String)> {
    token
        .split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
}

impl AdminCommand {
    /// Parse the first line of a frame. `None` means the command is
    /// unknown (or empty) and must be dropped without feedback.
    #[must_use]
    pub fn parse(line: &str) -> Option<Self> {
        let first_line = line.lines().next().unwrap_or("");
        let tokens: Vec<&str> = first_line.split_whitespace().collect();
        let (&command, args) = tokens.split_first()?;

        match command {
            "auth" => Some(Self::Auth {
                token: args.first().and_then(|t| token_value(t, "jwt")),
            }),
            "history" => Some(Self::History),
            "version" => Some(Self::Version),
            "subscribe" if !args.is_empty() => Some(Self::Subscribe(
                args.iter().map(|&s| s.to_string()).collect(),
            )),
            "unsubscribe" if !args.is_empty() => Some(Self::Unsubscribe(
                args.iter().map(|&s| s.to_string()).collect(),
            )),
            "mem_consumed" => Some(Self::MemConsumed),
            "total_avail_mem" => Some(Self::TotalAvailMem),
            "sent_bytes" => Some(Self::SentBytes),
            "recv_bytes" => Some(Self::RecvBytes),
            "uptime" => Some(Self::Uptime),
            "log_lines" => Some(Self::LogLines),
            "kill" if args.len() == 1 => Some(Self::Kill {
                pid: args[0].to_string(),
            }),
            "settings" => Some(Self::Settings),
            "channel_list" => Some(Self::ChannelList),
            "shutdown" => Some(Self::Shutdown),
            "set" if !args.is_empty() => Some(Self::Set(
                args.iter().filter_map(|t| key_value(t)).collect(),
            )),
            "update-log-levels" if !args.is_empty() => Some(Self::UpdateLogLevels(
                args.iter().filter_map(|t| key_value(t)).collect(),
            )),
            "updateroutetoken" if !args.is_empty() => Some(Self::UpdateRouteToken {
                json: args.join(" "),
            }),
            "migrate" if args.len() >= 4 => Some(Self::Migrate {
                status: args[0].to_string(),
                doc_key: args[1].to_string(),
                route_token: args[2].to_string(),
                server_id: args[3].to_string(),
            }),
            "wopiSrcMap" => Some(Self::WopiSrcMap),
            "verifyauth" => Some(Self::VerifyAuth {
                token: args.first().and_then(|t| token_value(t, "jwt")),
                id: args
                    .get(1)
                    .and_then(|t| token_value(t, "id"))
                    .unwrap_or_default(),
            }),
            "closemonitor" => Some(Self::CloseMonitor),
            other => QueryKind::parse(other).map(Self::Query),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_extracts_jwt_token() {
        assert_eq!(
            AdminCommand::parse("auth jwt=abc.def.ghi"),
            Some(AdminCommand::Auth {
                token: Some("abc.def.ghi".to_string())
            })
        );
        // Missing token and mis-keyed token both surface as None inside Auth.
        assert_eq!(
            AdminCommand::parse("auth"),
            Some(AdminCommand::Auth { token: None })
        );
        assert_eq!(
            AdminCommand::parse("auth bearer=abc"),
            Some(AdminCommand::Auth { token: None })
        );
    }

    #[test]
    fn queries_parse_to_their_kind() {
        for (name, kind) in [
            ("documents", QueryKind::Documents),
            ("active_users_count", QueryKind::ActiveUsersCount),
            ("active_docs_count", QueryKind::ActiveDocsCount),
            ("mem_stats", QueryKind::MemStats),
            ("cpu_stats", QueryKind::CpuStats),
            ("sent_activity", QueryKind::SentActivity),
            ("recv_activity", QueryKind::RecvActivity),
            ("connection_activity", QueryKind::ConnectionActivity),
        ] {
            assert_eq!(AdminCommand::parse(name), Some(AdminCommand::Query(kind)));
            assert_eq!(kind.name(), name);
        }
    }

    #[test]
    fn unknown_commands_are_dropped() {
        assert_eq!(AdminCommand::parse("frobnicate"), None);
        assert_eq!(AdminCommand::parse(""), None);
        assert_eq!(AdminCommand::parse("   "), None);
    }

    #[test]
    fn only_first_line_is_considered() {
        assert_eq!(
            AdminCommand::parse("uptime\nignored garbage"),
            Some(AdminCommand::Uptime)
        );
    }

    #[test]
    fn set_collects_pairs_and_skips_bare_tokens() {
        assert_eq!(
            AdminCommand::parse("set mem_stats_size=50 garbage cpu_stats_interval=2000"),
            Some(AdminCommand::Set(vec![
                ("mem_stats_size".to_string(), "50".to_string()),
                ("cpu_stats_interval".to_string(), "2000".to_string()),
            ]))
        );
    }

    #[test]
    fn subscribe_requires_channels() {
        assert_eq!(AdminCommand::parse("subscribe"), None);
        assert_eq!(
            AdminCommand::parse("subscribe mem_stats cpu_stats"),
            Some(AdminCommand::Subscribe(vec![
                "mem_stats".to_string(),
                "cpu_stats".to_string()
            ]))
        );
    }

    #[test]
    fn migrate_requires_all_fields() {
        assert_eq!(AdminCommand::parse("migrate saved dockey route"), None);
        assert_eq!(
            AdminCommand::parse("migrate unsaved doc1 tok srv9"),
            Some(AdminCommand::Migrate {
                status: "unsaved".to_string(),
                doc_key: "doc1".to_string(),
                route_token: "tok".to_string(),
                server_id: "srv9".to_string(),
            })
        );
    }

    #[test]
    fn verifyauth_extracts_token_and_id() {
        assert_eq!(
            AdminCommand::parse("verifyauth jwt=tok id=42"),
            Some(AdminCommand::VerifyAuth {
                token: Some("tok".to_string()),
                id: "42".to_string(),
            })
        );
        assert_eq!(
            AdminCommand::parse("verifyauth"),
            Some(AdminCommand::VerifyAuth {
                token: None,
                id: String::new(),
            })
        );
    }

    #[test]
    fn kill_keeps_raw_pid_text() {
        assert_eq!(
            AdminCommand::parse("kill not-a-pid"),
            Some(AdminCommand::Kill {
                pid: "not-a-pid".to_string()
            })
        );
        assert_eq!(AdminCommand::parse("kill 1 2"), None);
    }
}
