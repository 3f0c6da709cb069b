//! Cross-mirror metadata reconciliation.

use std::time::Duration;

use futures::future;
use reqwest::header::{CONTENT_LENGTH, ETAG};
use reqwest::Client;
use url::Url;

use crate::data::utils;
use crate::{Error, FileIdentity};

/// Metadata declared by a single mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
struct MirrorInfo {
    length: u64,
    tag: Option<String>,
}

/// Outcome of a successful reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled {
    /// Identity of the file all mirrors agree on.
    pub identity: FileIdentity,
    /// Default output file name, derived from the first mirror.
    pub file_name: String,
}

/// Probe every mirror concurrently and check that they all serve the same file.
///
/// All probes are awaited before deciding, and a single failing mirror fails the whole reconciliation.
pub async fn reconcile(client: &Client, mirrors: &[Url], timeout: Duration) -> Result<Reconciled, Error> {
    let first = mirrors.first().ok_or(Error::NoMirrors)?;

    let probes = future::join_all(mirrors.iter().map(|mirror| probe(client, mirror, timeout))).await;
    let infos = probes.into_iter().collect::<Result<Vec<_>, _>>()?;

    let length = infos[0].length;
    let mut tag: Option<&str> = None;

    for (mirror, info) in mirrors.iter().zip(&infos) {
        if info.length != length {
            return Err(Error::InconsistentMirrors {
                mirror: mirror.clone(),
                reason: format!("length {} differs from {length}", info.length),
            });
        }

        match (tag, info.tag.as_deref()) {
            (Some(common), Some(other)) if common != other => {
                return Err(Error::InconsistentMirrors {
                    mirror: mirror.clone(),
                    reason: format!("tag `{other}` differs from `{common}`"),
                });
            }
            (None, other) => tag = other,
            _ => {}
        }
    }

    let reconciled = Reconciled {
        identity: FileIdentity {
            length,
            tag: tag.map(str::to_owned),
        },
        file_name: utils::file_name(first).to_owned(),
    };

    tracing::debug!(
        "Reconciled {} mirrors: length={length} bytes, tag={:?}, file name=`{}`",
        mirrors.len(),
        reconciled.identity.tag,
        reconciled.file_name
    );

    Ok(reconciled)
}

async fn probe(client: &Client, mirror: &Url, timeout: Duration) -> Result<MirrorInfo, Error> {
    tracing::trace!("Probing mirror `{mirror}`...");

    let connection = |source| Error::Connection {
        mirror: mirror.clone(),
        source,
    };

    let resp = client.head(mirror.clone()).timeout(timeout).send().await.map_err(connection)?;

    if !resp.status().is_success() {
        return Err(Error::BadStatus {
            mirror: mirror.clone(),
            status: resp.status(),
        });
    }

    // the body size hint of a HEAD response is always zero, only the header holds the length
    let headers = resp.headers();
    let length = headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
        .ok_or_else(|| Error::MissingLength { mirror: mirror.clone() })?;

    let tag = headers
        .get(ETAG)
        .and_then(|value| value.to_str().ok())
        .and_then(utils::strip_quotes)
        .map(str::to_owned);

    tracing::trace!("Mirror `{mirror}` declared length={length}, tag={tag:?}");

    Ok(MirrorInfo { length, tag })
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    async fn mirror(status: u16, length: Option<u64>, tag: Option<&str>) -> MockServer {
        let server = MockServer::start().await;

        let mut template = ResponseTemplate::new(status);
        if let Some(length) = length {
            template = template.insert_header("content-length", length.to_string());
        }
        if let Some(tag) = tag {
            template = template.insert_header("etag", tag);
        }

        Mock::given(method("HEAD")).respond_with(template).mount(&server).await;

        server
    }

    use crate::testing::url;

    #[tokio::test]
    async fn test_no_mirrors() {
        let result = reconcile(&Client::new(), &[], TIMEOUT).await;

        assert!(matches!(result, Err(Error::NoMirrors)));
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_agreeing_mirrors_with_missing_tag() {
        let servers = [
            mirror(200, Some(100), Some("\"abc\"")).await,
            mirror(200, Some(100), None).await,
            mirror(200, Some(100), Some("\"abc\"")).await,
        ];
        let mirrors: Vec<_> = servers.iter().map(|server| url(server, "pub/file.iso")).collect();

        let reconciled = reconcile(&Client::new(), &mirrors, TIMEOUT).await.unwrap();

        assert_eq!(
            reconciled.identity,
            FileIdentity {
                length: 100,
                tag: Some("abc".into())
            }
        );
        assert_eq!(reconciled.file_name, "file.iso");
        assert!(logs_contain("Reconciled 3 mirrors"));
    }

    #[tokio::test]
    async fn test_first_mirror_without_tag() {
        let servers = [mirror(200, Some(42), None).await, mirror(200, Some(42), Some("xyz")).await];
        let mirrors: Vec<_> = servers.iter().map(|server| url(server, "/")).collect();

        let reconciled = reconcile(&Client::new(), &mirrors, TIMEOUT).await.unwrap();

        assert_eq!(reconciled.identity.tag.as_deref(), Some("xyz"));
        assert_eq!(reconciled.file_name, utils::FALLBACK_FILE_NAME);
    }

    #[tokio::test]
    async fn test_inconsistent_lengths() {
        let servers = [
            mirror(200, Some(100), None).await,
            mirror(200, Some(101), None).await,
            mirror(200, Some(100), None).await,
        ];
        let mirrors: Vec<_> = servers.iter().map(|server| url(server, "file")).collect();

        let result = reconcile(&Client::new(), &mirrors, TIMEOUT).await;

        assert!(matches!(result, Err(Error::InconsistentMirrors { mirror, .. }) if mirror == mirrors[1]));
    }

    #[tokio::test]
    async fn test_inconsistent_tags() {
        let servers = [
            mirror(200, Some(100), None).await,
            mirror(200, Some(100), Some("\"abc\"")).await,
            mirror(200, Some(100), Some("\"abd\"")).await,
        ];
        let mirrors: Vec<_> = servers.iter().map(|server| url(server, "file")).collect();

        let result = reconcile(&Client::new(), &mirrors, TIMEOUT).await;

        assert!(matches!(result, Err(Error::InconsistentMirrors { mirror, .. }) if mirror == mirrors[2]));
    }

    #[tokio::test]
    async fn test_single_bad_mirror_aborts() {
        let servers = [
            mirror(200, Some(100), None).await,
            mirror(404, None, None).await,
            mirror(200, Some(100), None).await,
        ];
        let mirrors: Vec<_> = servers.iter().map(|server| url(server, "file")).collect();

        let result = reconcile(&Client::new(), &mirrors, TIMEOUT).await;

        assert!(matches!(
            result,
            Err(Error::BadStatus { mirror, status }) if mirror == mirrors[1] && status.as_u16() == 404
        ));
    }

    #[tokio::test]
    async fn test_missing_length() {
        let server = mirror(200, None, None).await;

        let result = reconcile(&Client::new(), &[url(&server, "file")], TIMEOUT).await;

        assert!(matches!(result, Err(Error::MissingLength { .. })));
    }

    #[tokio::test]
    async fn test_unreachable_mirror() {
        let server = mirror(200, Some(100), None).await;
        let unreachable = crate::testing::closed_mirror();

        let result = reconcile(&Client::new(), &[url(&server, "file"), unreachable.clone()], TIMEOUT).await;

        assert!(matches!(result, Err(Error::Connection { mirror, .. }) if mirror == unreachable));
    }
}
