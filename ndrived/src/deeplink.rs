use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

use crate::direct_edit::EditRequest;

pub const SCHEME: &str = "nxdrive";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeepLinkError {
    #[error("not an nxdrive:// link: {0}")]
    WrongScheme(String),
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("{command} link is missing {field}")]
    Missing {
        command: &'static str,
        field: &'static str,
    },
    #[error("badly encoded segment: {0}")]
    Encoding(String),
}

/// A parsed `nxdrive://` link.
///
/// Layouts:
/// - `token/<token>/user/<user>`
/// - `edit/<scheme>/<host>[/<ctx>...]/user/<user>/repo/<repo>/nxdocid/<id>/filename/<name>[/downloadUrl/<path>...]`
/// - `access-online/<local path>`, `copy-share-link/<local path>`, `edit-metadata/<local path>`
/// - `direct-transfer/<local path>` plus any number of `?path=` parameters
/// - `authorize?code=<code>[&state=<state>]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeepLink {
    Token { token: String, user: String },
    Edit(EditRequest),
    AccessOnline { path: PathBuf },
    CopyShareLink { path: PathBuf },
    EditMetadata { path: PathBuf },
    DirectTransfer { paths: Vec<PathBuf> },
    Authorize { code: String, state: Option<String> },
}

impl DeepLink {
    pub fn command(&self) -> &'static str {
        match self {
            DeepLink::Token { .. } => "token",
            DeepLink::Edit(_) => "edit",
            DeepLink::AccessOnline { .. } => "access-online",
            DeepLink::CopyShareLink { .. } => "copy-share-link",
            DeepLink::EditMetadata { .. } => "edit-metadata",
            DeepLink::DirectTransfer { .. } => "direct-transfer",
            DeepLink::Authorize { .. } => "authorize",
        }
    }
}

impl FromStr for DeepLink {
    type Err = DeepLinkError;

    fn from_str(link: &str) -> Result<Self, Self::Err> {
        let link = link.trim();
        let rest = link
            .split_once("://")
            .filter(|(scheme, _)| scheme.eq_ignore_ascii_case(SCHEME))
            .map(|(_, rest)| rest)
            .ok_or_else(|| DeepLinkError::WrongScheme(link.to_string()))?;
        let (path, query) = match rest.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (rest, None),
        };
        let params: Vec<(String, String)> = query
            .map(|q| {
                url::form_urlencoded::parse(q.as_bytes())
                    .into_owned()
                    .collect()
            })
            .unwrap_or_default();
        let segments = path
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(decode)
            .collect::<Result<Vec<_>, _>>()?;
        let Some((command, args)) = segments.split_first() else {
            return Err(DeepLinkError::UnknownCommand(String::new()));
        };

        match command.to_ascii_lowercase().as_str() {
            "token" => parse_token(args),
            "edit" => parse_edit(args).map(DeepLink::Edit),
            "access-online" => Ok(DeepLink::AccessOnline {
                path: local_path("access-online", args)?,
            }),
            "copy-share-link" => Ok(DeepLink::CopyShareLink {
                path: local_path("copy-share-link", args)?,
            }),
            "edit-metadata" => Ok(DeepLink::EditMetadata {
                path: local_path("edit-metadata", args)?,
            }),
            "direct-transfer" => {
                let mut paths = Vec::new();
                if !args.is_empty() {
                    paths.push(join_path(args));
                }
                paths.extend(
                    params
                        .iter()
                        .filter(|(key, _)| key == "path")
                        .map(|(_, value)| PathBuf::from(value)),
                );
                if paths.is_empty() {
                    return Err(DeepLinkError::Missing {
                        command: "direct-transfer",
                        field: "path",
                    });
                }
                Ok(DeepLink::DirectTransfer { paths })
            }
            "authorize" => {
                let param = |name: &str| {
                    params
                        .iter()
                        .find(|(key, _)| key == name)
                        .map(|(_, value)| value.clone())
                };
                Ok(DeepLink::Authorize {
                    code: param("code").ok_or(DeepLinkError::Missing {
                        command: "authorize",
                        field: "code",
                    })?,
                    state: param("state"),
                })
            }
            other => Err(DeepLinkError::UnknownCommand(other.to_string())),
        }
    }
}

fn decode(segment: &str) -> Result<String, DeepLinkError> {
    urlencoding::decode(segment)
        .map(|value| value.into_owned())
        .map_err(|_| DeepLinkError::Encoding(segment.to_string()))
}

fn parse_token(args: &[String]) -> Result<DeepLink, DeepLinkError> {
    let missing = |field| DeepLinkError::Missing {
        command: "token",
        field,
    };
    let token = args.first().ok_or_else(|| missing("token"))?;
    let user = value_after(args, "user").ok_or_else(|| missing("user"))?;
    Ok(DeepLink::Token {
        token: token.clone(),
        user: user.clone(),
    })
}

fn parse_edit(args: &[String]) -> Result<EditRequest, DeepLinkError> {
    let missing = |field| DeepLinkError::Missing {
        command: "edit",
        field,
    };
    let user_at = args
        .iter()
        .position(|segment| segment == "user")
        .ok_or_else(|| missing("user"))?;
    let (scheme, server) = args[..user_at]
        .split_first()
        .filter(|(_, server)| !server.is_empty())
        .ok_or_else(|| missing("server"))?;
    let server_url = format!("{scheme}://{}", server.join("/"));
    let tail = &args[user_at..];

    let download_url = tail
        .iter()
        .position(|segment| segment == "downloadUrl")
        .map(|at| tail[at + 1..].join("/"))
        .filter(|path| !path.is_empty())
        .map(|path| format!("{server_url}/{path}"));
    let head = match tail.iter().position(|segment| segment == "downloadUrl") {
        Some(at) => &tail[..at],
        None => tail,
    };
    Ok(EditRequest {
        user: value_after(head, "user").ok_or_else(|| missing("user"))?.clone(),
        doc_id: value_after(head, "nxdocid")
            .ok_or_else(|| missing("nxdocid"))?
            .clone(),
        file_name: value_after(head, "filename")
            .ok_or_else(|| missing("filename"))?
            .clone(),
        server_url,
        download_url,
    })
}

fn value_after<'a>(args: &'a [String], key: &str) -> Option<&'a String> {
    args.iter()
        .position(|segment| segment == key)
        .and_then(|at| args.get(at + 1))
}

fn local_path(command: &'static str, args: &[String]) -> Result<PathBuf, DeepLinkError> {
    if args.is_empty() {
        return Err(DeepLinkError::Missing {
            command,
            field: "path",
        });
    }
    Ok(join_path(args))
}

fn join_path(args: &[String]) -> PathBuf {
    let joined = args.join("/");
    // Windows drive paths arrive as `C:/...`.
    if joined.len() > 1 && joined.as_bytes()[1] == b':' {
        PathBuf::from(joined)
    } else {
        PathBuf::from(format!("/{joined}"))
    }
}

/// Server pages a document link can point at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentPage {
    Online,
    Share,
    Metadata,
}

impl DocumentPage {
    pub fn url(&self, server_url: &str, remote_ref: &str) -> String {
        let server = server_url.trim_end_matches('/');
        let uid = urlencoding::encode(remote_ref);
        match self {
            DocumentPage::Online => format!("{server}/ui/#!/doc/{uid}"),
            DocumentPage::Share => format!("{server}/nxdoc/default/{uid}/view_documents"),
            DocumentPage::Metadata => format!("{server}/ui/#!/doc/{uid}?view=edit"),
        }
    }
}
