//! post the pristine state to a remote

use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use serde_json::{Map, Value};
use tracing::info;

use crate::error::{Error, Result};
use crate::fragment::{filter, Fragment};
use crate::hash::Hash;
use crate::json::{self, i64_field};
use crate::repo::Repo;
use crate::session::{expect_success, Session};
use crate::transport::local::{push_local, TransferStats};
use crate::transport::progress::Progress;
use crate::transport::remote::{authorized, Remote, RemoteInfo, Target};
use crate::transport::upload::{upload_objects, UploadSummary};
use crate::types::State;

/// post options
#[derive(Debug, Clone, Default)]
pub struct PostOptions {
    /// commit message; defaults to the last local commit message
    pub message: Option<String>,
    pub rev: Option<i64>,
    /// extra body fields, checked against the remote's allowed list
    pub envelope: Map<String, Value>,
    /// re-upload objects the remote already has
    pub force: bool,
}

/// what the remote reported back
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PostResult {
    pub state_sha: Option<String>,
    pub rev: Option<i64>,
    pub trail_id: Option<String>,
    pub upload: UploadSummary,
    /// set for local-path remotes
    pub local: Option<TransferStats>,
}

/// post the pristine state (or the `#fragment` part of it) to `target`
///
/// objects are uploaded first; the state is posted only once every upload
/// has succeeded.
pub fn post(
    session: &Session,
    repo: &Repo,
    target: &str,
    opts: &PostOptions,
    progress: &Progress,
) -> Result<PostResult> {
    let (target, parts) = Target::parse(target)?;
    let state = filter(&repo.pristine()?, &parts);

    let url = match target {
        Target::Local(local) => {
            let stats = push_local(repo.pool(), &local, &state)?;
            info!(path = %local.json_path.display(), "state written");
            return Ok(PostResult {
                state_sha: Some(Hash::of_bytes(&state.to_canonical()).to_hex()),
                local: Some(stats),
                ..PostResult::default()
            });
        }
        Target::Http(url) => url,
    };

    let remote = Remote::discover(session, &url)?;
    let baseline = remote.state()?.unwrap_or_default();
    let upload = upload_objects(&remote, repo.pool(), &state, &baseline, opts.force, progress)?;

    let message = match &opts.message {
        Some(m) => Some(m.clone()),
        None => repo.commit_message()?,
    };
    let body = post_body(remote.info(), &state, message.as_deref(), opts.rev, &opts.envelope)?;
    let bytes = json::to_canonical_vec(&body);

    let post_url = &remote.info().post_url;
    let response = expect_success(session.send(|client, bearer| {
        authorized(client.post(post_url), bearer)
            .header(CONTENT_TYPE, "application/json")
            .header(CONTENT_LENGTH, bytes.len())
            .body(bytes.clone())
    })?)?;
    let reply = response.bytes()?;
    let reply = json::parse_object(&reply, post_url)?;

    let mut result = parse_post_reply(&reply)?;
    result.upload = upload;
    info!(
        state_sha = result.state_sha.as_deref().unwrap_or("-"),
        rev = ?result.rev,
        trail = result.trail_id.as_deref().unwrap_or("-"),
        "state posted"
    );
    Ok(result)
}

/// `{<json-key>: state, commit-msg, rev, ...envelope}`
pub fn post_body(
    info: &RemoteInfo,
    state: &State,
    message: Option<&str>,
    rev: Option<i64>,
    envelope: &Map<String, Value>,
) -> Result<Value> {
    let key = info.post_key();
    let allowed: Vec<&str> = info
        .post_fields
        .iter()
        .chain(&info.post_fields_opt)
        .map(String::as_str)
        .collect();

    let mut body = Map::new();
    for (field, value) in envelope {
        if field == key || (!allowed.is_empty() && !allowed.contains(&field.as_str())) {
            return Err(Error::Malformed {
                what: "post envelope",
                message: format!("field {field:?} is not accepted by the remote"),
            });
        }
        body.insert(field.clone(), value.clone());
    }

    if let Some(message) = message {
        body.insert("commit-msg".into(), Value::String(message.to_string()));
    }
    if let Some(rev) = rev {
        body.insert("rev".into(), Value::from(rev));
    }
    body.insert(key.to_string(), state.to_value());

    for required in &info.post_fields {
        if !body.contains_key(required) {
            return Err(Error::Malformed {
                what: "post envelope",
                message: format!("remote requires field {required:?}"),
            });
        }
    }
    Ok(Value::Object(body))
}

fn parse_post_reply(reply: &Map<String, Value>) -> Result<PostResult> {
    let text = |key: &str| reply.get(key).and_then(Value::as_str).map(str::to_string);

    let mut rev = i64_field(reply, "rev")?;
    if rev == Some(-1) {
        rev = match reply.get("revlocal") {
            Some(Value::String(s)) => s.parse().ok(),
            Some(_) => i64_field(reply, "revlocal")?,
            None => None,
        };
    }

    Ok(PostResult {
        state_sha: text("state-sha"),
        rev,
        trail_id: text("trail-id"),
        ..PostResult::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{commit, stage};
    use crate::session::{test_env, NoPrompt};
    use crate::types::StateValue;
    use httptest::{matchers::*, responders::*, Expectation, Server};
    use std::fs;
    use tempfile::tempdir;

    fn info(server: &Server) -> Value {
        serde_json::json!({
            "pvr-spec": "pvr-remote-1",
            "json-get-url": server.url_str("/state"),
            "json-key": "",
            "objects-endpoint": server.url_str("/objects"),
            "post-url": server.url_str("/steps"),
            "post-fields": ["commit-msg"],
            "post-fields-opt": ["rev"],
        })
    }

    #[test]
    fn test_post_body_layout() {
        let info: RemoteInfo = serde_json::from_value(serde_json::json!({
            "json-get-url": "http://h/s", "objects-endpoint": "http://h/o",
            "post-url": "http://h/p", "json-key": "state",
            "post-fields": ["commit-msg"], "post-fields-opt": ["rev", "meta"],
        }))
        .unwrap();
        let state = State::with_spec("pantavisor-service-system@1");

        let mut envelope = Map::new();
        envelope.insert("meta".into(), Value::from("x"));
        let body = post_body(&info, &state, Some("msg"), Some(3), &envelope).unwrap();
        assert_eq!(
            json::to_canonical_string(&body),
            r##"{"commit-msg":"msg","meta":"x","rev":3,"state":{"#spec":"pantavisor-service-system@1"}}"##
        );

        let mut bad = Map::new();
        bad.insert("owner".into(), Value::from("me"));
        assert!(post_body(&info, &state, Some("msg"), None, &bad).is_err());
        // commit-msg is required by this remote
        assert!(post_body(&info, &state, None, None, &Map::new()).is_err());
    }

    #[test]
    fn test_reply_revlocal_fallback() {
        let reply = json::parse_object(
            br#"{"state-sha":"abc","rev":-1,"revlocal":"12","trail-id":"t1"}"#,
            "reply",
        )
        .unwrap();
        let result = parse_post_reply(&reply).unwrap();
        assert_eq!(result.rev, Some(12));
        assert_eq!(result.state_sha.as_deref(), Some("abc"));
        assert_eq!(result.trail_id.as_deref(), Some("t1"));

        let overflow = json::parse_object(br#"{"rev":99999999999999999999}"#, "reply").unwrap();
        assert!(matches!(
            parse_post_reply(&overflow),
            Err(Error::NumberOverflow(_))
        ));
    }

    // two keys share one blob, a third blob is already on the remote
    #[test]
    fn test_post_uploads_each_digest_once() {
        let dir = tempdir().unwrap();
        let repo = Repo::init(&dir.path().join("repo")).unwrap();
        fs::write(repo.root().join("a.bin"), vec![1u8; 4096]).unwrap();
        fs::write(repo.root().join("copy.bin"), vec![1u8; 4096]).unwrap();
        fs::write(repo.root().join("known.bin"), b"already there").unwrap();
        stage(&repo, &[], false).unwrap();
        commit(&repo, "first post", false).unwrap();

        let shared = Hash::of_bytes(&[1u8; 4096]);
        let known = Hash::of_bytes(b"already there");

        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/.pvrremote"))
                .respond_with(json_encoded(info(&server))),
        );
        let mut remote_state = State::with_spec("pantavisor-service-system@1");
        remote_state.insert("known.bin", StateValue::ObjectRef(known));
        server.expect(
            Expectation::matching(request::method_path("GET", "/state"))
                .respond_with(status_code(200).body(remote_state.to_canonical())),
        );
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/objects"),
                request::body(json_decoded(eq(serde_json::json!({
                    "objectname": "a.bin",
                    "sha256sum": shared.to_hex(),
                    "size": "4096",
                    "mime-type": "application/octet-stream",
                })))),
            ])
            .times(1)
            .respond_with(json_encoded(serde_json::json!({
                "sha256sum": shared.to_hex(),
                "signed-puturl": server.url_str("/s3/shared"),
            }))),
        );
        server.expect(
            Expectation::matching(all_of![
                request::method_path("PUT", "/s3/shared"),
                request::headers(contains(("content-length", "4096"))),
            ])
            .times(1)
            .respond_with(status_code(200)),
        );
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/steps"),
                request::body(json_decoded(eq(serde_json::json!({
                    "commit-msg": "first post",
                    "post": serde_json::from_slice::<Value>(&repo.pristine().unwrap().to_canonical()).unwrap(),
                })))),
            ])
            .respond_with(json_encoded(serde_json::json!({
                "state-sha": "deadbeef",
                "rev": 4,
                "trail-id": "trail-1",
            }))),
        );

        let session = Session::new(test_env(dir.path()), Box::new(NoPrompt)).unwrap();
        let result = post(
            &session,
            &repo,
            &server.url_str("/"),
            &PostOptions::default(),
            &Progress::silent(),
        )
        .unwrap();

        assert_eq!(result.upload.uploaded, 1);
        assert_eq!(result.upload.bytes, 4096);
        assert_eq!(result.rev, Some(4));
        assert_eq!(result.state_sha.as_deref(), Some("deadbeef"));
    }

    #[test]
    fn test_conflict_link_and_existing() {
        let dir = tempdir().unwrap();
        let repo = Repo::init(&dir.path().join("repo")).unwrap();
        fs::write(repo.root().join("link.bin"), b"linked content").unwrap();
        fs::write(repo.root().join("dup.bin"), b"duplicate content").unwrap();
        stage(&repo, &[], false).unwrap();
        commit(&repo, "conflicts", false).unwrap();

        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/.pvrremote"))
                .respond_with(json_encoded(info(&server))),
        );
        server.expect(
            Expectation::matching(request::method_path("GET", "/state"))
                .respond_with(status_code(404)),
        );
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/objects"),
                request::body(matches("link.bin")),
            ])
            .respond_with(status_code(409).insert_header("Pantahub-Object-Type", "link")),
        );
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/objects"),
                request::body(matches("dup.bin")),
            ])
            .respond_with(status_code(409).insert_header("Pantahub-Object-Type", "object")),
        );
        server.expect(
            Expectation::matching(request::method_path("POST", "/steps"))
                .respond_with(json_encoded(serde_json::json!({"rev": 1}))),
        );

        let session = Session::new(test_env(dir.path()), Box::new(NoPrompt)).unwrap();
        let result = post(
            &session,
            &repo,
            &server.url_str("/"),
            &PostOptions::default(),
            &Progress::silent(),
        )
        .unwrap();
        assert_eq!(result.upload.linked, 1);
        assert_eq!(result.upload.existing, 1);
        assert_eq!(result.upload.uploaded, 0);
    }

    #[test]
    fn test_failed_upload_blocks_post() {
        let dir = tempdir().unwrap();
        let repo = Repo::init(&dir.path().join("repo")).unwrap();
        fs::write(repo.root().join("x.bin"), b"payload").unwrap();
        stage(&repo, &[], false).unwrap();
        commit(&repo, "will fail", false).unwrap();

        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/.pvrremote"))
                .respond_with(json_encoded(info(&server))),
        );
        server.expect(
            Expectation::matching(request::method_path("GET", "/state"))
                .respond_with(status_code(404)),
        );
        server.expect(
            Expectation::matching(request::method_path("POST", "/objects"))
                .respond_with(status_code(500)),
        );
        // no expectation for POST /steps

        let session = Session::new(test_env(dir.path()), Box::new(NoPrompt)).unwrap();
        let err = post(
            &session,
            &repo,
            &server.url_str("/"),
            &PostOptions::default(),
            &Progress::silent(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Transfers { total: 1, .. }));
    }
    // second post sees 409 for every object; force re-uploads non-link ones
    #[test]
    fn test_repeated_post_with_and_without_force() {
        let dir = tempdir().unwrap();
        let repo = Repo::init(&dir.path().join("repo")).unwrap();
        fs::write(repo.root().join("rootfs.img"), vec![7u8; 2048]).unwrap();
        stage(&repo, &[], false).unwrap();
        commit(&repo, "again", false).unwrap();
        let digest = Hash::of_bytes(&[7u8; 2048]);

        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/.pvrremote"))
                .times(3)
                .respond_with(json_encoded(info(&server))),
        );
        server.expect(
            Expectation::matching(request::method_path("GET", "/state"))
                .times(3)
                .respond_with(status_code(404)),
        );
        server.expect(
            Expectation::matching(request::method_path("POST", "/objects"))
                .times(3)
                .respond_with(cycle![
                    json_encoded(serde_json::json!({
                        "signed-puturl": server.url_str("/s3/rootfs"),
                    })),
                    status_code(409).insert_header("Pantahub-Object-Type", "object"),
                    status_code(409).insert_header("Pantahub-Object-Type", "object"),
                ]),
        );
        server.expect(
            Expectation::matching(request::method_path(
                "PUT",
                format!("/objects/{digest}"),
            ))
            .respond_with(json_encoded(serde_json::json!({
                "signed-puturl": server.url_str("/s3/rootfs"),
            }))),
        );
        server.expect(
            Expectation::matching(request::method_path("PUT", "/s3/rootfs"))
                .times(2)
                .respond_with(status_code(200)),
        );
        server.expect(
            Expectation::matching(request::method_path("POST", "/steps"))
                .times(3)
                .respond_with(json_encoded(serde_json::json!({"rev": 0}))),
        );

        let session = Session::new(test_env(dir.path()), Box::new(NoPrompt)).unwrap();
        let url = server.url_str("/");
        let plain = PostOptions::default();
        let forced = PostOptions {
            force: true,
            ..PostOptions::default()
        };

        let first = post(&session, &repo, &url, &plain, &Progress::silent()).unwrap();
        assert_eq!(first.upload.uploaded, 1);

        let second = post(&session, &repo, &url, &plain, &Progress::silent()).unwrap();
        assert_eq!(second.upload.existing, 1);
        assert_eq!(second.upload.uploaded, 0);

        let third = post(&session, &repo, &url, &forced, &Progress::silent()).unwrap();
        assert_eq!(third.upload.uploaded, 1);
    }
}
