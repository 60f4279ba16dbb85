use url::Url;
use urlencoding::encode;

const INVITE_SCHEME: &str = "watchparty";

/// A room to join, as carried by an invite link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InviteLink {
    pub room_id: String,
    pub passcode: Option<String>,
}

pub fn build_invite_url(room_id: &str, passcode: Option<&str>) -> String {
    let mut params = vec![format!("room={}", encode(room_id))];
    if let Some(code) = passcode.filter(|c| !c.is_empty()) {
        params.push(format!("code={}", encode(code)));
    }
    format!("{INVITE_SCHEME}://join?{}", params.join("&"))
}

/// Accepts `watchparty://join?...`, an http(s) link with the same query,
/// or a bare `room=...&code=...` query
pub fn parse_invite_url(input: &str) -> Option<InviteLink> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }

    let normalized = if trimmed.starts_with(&format!("{INVITE_SCHEME}://"))
        || trimmed.starts_with("http://")
        || trimmed.starts_with("https://")
    {
        trimmed.to_string()
    } else {
        format!("{INVITE_SCHEME}://join?{trimmed}")
    };

    let url = Url::parse(&normalized).ok()?;
    let mut room_id = None;
    let mut passcode = None;
    // query_pairs already percent-decodes
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "room" => room_id = Some(value.into_owned()),
            "code" => passcode = Some(value.into_owned()),
            _ => {}
        }
    }

    let room_id = room_id.filter(|id| !id.is_empty())?;
    Some(InviteLink {
        room_id,
        passcode: passcode.filter(|code| !code.is_empty()),
    })
}
