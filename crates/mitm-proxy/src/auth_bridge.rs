//! Auth bridge (C5): the loopback HTTP endpoint a pre-patched launcher
//! talks to instead of Mojang's session server, plus the outbound leg
//! that forwards a rewritten join request to the real thing.
//!
//! Grounded on `mcproxy.c`'s `handle_http_request`/`post_session_join`:
//! a hand-rolled `Content-Length`-only HTTP/1.1 parse on the inbound
//! side (no need for a framework to answer one fixed request shape),
//! and `reqwest` on the outbound side -- the idiomatic async HTTPS
//! client across the broader retrieval pack's server implementations.

use anyhow::{Context, Result, anyhow};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Fields scraped from the intercepted join request body by naive key
/// search, exactly as the source does rather than a full JSON parse.
#[derive(Debug, Clone, Default)]
pub struct JoinRequest {
    pub access_token: String,
    pub selected_profile: String,
    pub server_id: String,
}

/// Read one HTTP/1.1 request off `stream`, parse its `Content-Length`
/// header, read exactly that many body bytes, and naive-key-search the
/// three join fields out of the JSON body. Replies `204 No Content` and
/// returns the scraped fields.
pub async fn handle_join_request(stream: &mut TcpStream) -> Result<JoinRequest> {
    let headers = read_http_headers(stream).await?;
    let content_length = parse_content_length(&headers)
        .ok_or_else(|| anyhow!("loopback join request missing Content-Length"))?;

    let mut body = vec![0u8; content_length];
    stream
        .read_exact(&mut body)
        .await
        .context("reading loopback join request body")?;
    let body = String::from_utf8_lossy(&body);

    let join = JoinRequest {
        access_token: extract_json_field(&body, "accessToken").unwrap_or_default(),
        selected_profile: extract_json_field(&body, "selectedProfile").unwrap_or_default(),
        server_id: extract_json_field(&body, "serverId").unwrap_or_default(),
    };

    let response = b"HTTP/1.1 204 No Content\r\nConnection: close\r\nContent-Length: 0\r\n\r\n";
    stream
        .write_all(response)
        .await
        .context("writing loopback 204 response")?;

    Ok(join)
}

/// Read headers off `stream` up to the blank line terminating them,
/// byte by byte -- the request body length isn't known until we've
/// parsed `Content-Length`, so we can't just read a fixed chunk.
async fn read_http_headers(stream: &mut TcpStream) -> Result<String> {
    let mut headers = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(anyhow!("connection closed before headers completed"));
        }
        headers.push(byte[0]);
        if headers.ends_with(b"\r\n\r\n") {
            break;
        }
        if headers.len() > 64 * 1024 {
            return Err(anyhow!("loopback request headers exceeded 64 KiB"));
        }
    }
    Ok(String::from_utf8_lossy(&headers).into_owned())
}

fn parse_content_length(headers: &str) -> Option<usize> {
    headers.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("content-length") {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}

/// Find `"key":"value"` in `body` without a full JSON parse, matching
/// the source's `strstr`-based field extraction.
fn extract_json_field(body: &str, key: &str) -> Option<String> {
    let needle = format!("\"{key}\"");
    let key_pos = body.find(&needle)?;
    let after_key = &body[key_pos + needle.len()..];
    let colon_pos = after_key.find(':')?;
    let after_colon = after_key[colon_pos + 1..].trim_start();
    let value_start = after_colon.find('"')? + 1;
    let rest = &after_colon[value_start..];
    let value_end = rest.find('"')?;
    Some(rest[..value_end].to_string())
}

/// POST the rewritten join request to the real session server, with
/// `serverId` replaced by the proxy-computed session hash. Failure here
/// is logged and non-fatal (§7): the handshake still completes locally.
pub async fn forward_join_to_session_server(
    client: &reqwest::Client,
    join: &JoinRequest,
    rewritten_server_id: &str,
) -> Result<()> {
    let body = serde_json::json!({
        "accessToken": join.access_token,
        "selectedProfile": join.selected_profile,
        "serverId": rewritten_server_id,
    });

    let response = client
        .post("https://sessionserver.mojang.com/session/minecraft/join")
        .header("Content-Type", "application/json; charset=utf-8")
        .header("User-Agent", "Java/1.6.0_27")
        .json(&body)
        .send()
        .await
        .context("POST to real session server failed")?;

    if !response.status().is_success() {
        return Err(anyhow!(
            "session server rejected join: {}",
            response.status()
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_fields_by_naive_key_search() {
        let body = r#"{"accessToken":"abc123","selectedProfile":"deadbeef","serverId":"X"}"#;
        assert_eq!(
            extract_json_field(body, "accessToken"),
            Some("abc123".to_string())
        );
        assert_eq!(
            extract_json_field(body, "selectedProfile"),
            Some("deadbeef".to_string())
        );
        assert_eq!(extract_json_field(body, "serverId"), Some("X".to_string()));
    }

    #[test]
    fn missing_field_is_none() {
        let body = r#"{"accessToken":"abc123"}"#;
        assert_eq!(extract_json_field(body, "selectedProfile"), None);
    }

    #[test]
    fn content_length_header_is_case_insensitive() {
        let headers = "POST /session/minecraft/join HTTP/1.1\r\ncontent-length: 42\r\n\r\n";
        assert_eq!(parse_content_length(headers), Some(42));
    }

    #[test]
    fn content_length_missing_is_none() {
        let headers = "POST /session/minecraft/join HTTP/1.1\r\n\r\n";
        assert_eq!(parse_content_length(headers), None);
    }

    #[test]
    fn fields_survive_whitespace_around_colon() {
        let body = r#"{"accessToken" :  "tok", "serverId":"srv"}"#;
        assert_eq!(extract_json_field(body, "accessToken"), Some("tok".to_string()));
        assert_eq!(extract_json_field(body, "serverId"), Some("srv".to_string()));
    }
}
