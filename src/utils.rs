use rand::Rng;

pub fn random_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}

/// Prefixes a bare ICE host with `stun:` or `turn:`; urls that already carry a scheme are kept.
pub fn add_ice_url_scheme(url: &str, turn: bool) -> String {
    let url = url.trim();
    if ["stun:", "stuns:", "turn:", "turns:"]
        .iter()
        .any(|scheme| url.starts_with(scheme))
    {
        url.to_string()
    } else {
        let scheme = if turn { "turn:" } else { "stun:" };
        format!("{scheme}{url}")
    }
}
