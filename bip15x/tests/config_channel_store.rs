use bip15x::config::{ChannelConfig, CookieConfig};
use bip15x::protocol::AuthMode;

#[test]
fn example_channel_config_store() -> anyhow::Result<()> {
    let tmpdir = tempfile::tempdir()?;
    let path = tmpdir.path().join("channel.toml");

    let c = ChannelConfig {
        max_packet_payload: 4096,
        peer_timeout_secs: Some(120.0),
        auth_mode: AuthMode::OneWay,
        cookies: Some(CookieConfig {
            own_cookie: Some(tmpdir.path().join("own.cookie")),
            peer_cookie: None,
        }),
        ..ChannelConfig::default()
    };
    c.validate()?;
    c.store(&path)?;

    let c2 = ChannelConfig::load(&path)?;
    assert_eq!(c, c2);
    assert!(std::fs::read_to_string(&path)?.contains("auth_mode = \"one-way\""));
    Ok(())
}

#[test]
fn tilde_in_cookie_paths_is_resolved() -> anyhow::Result<()> {
    let tmpdir = tempfile::tempdir()?;
    let path = tmpdir.path().join("channel.toml");
    std::fs::write(&path, "[cookies]\npeer_cookie = \"~/server.cookie\"\n")?;

    let c = ChannelConfig::load(&path)?;
    let peer_cookie = c.cookies.and_then(|c| c.peer_cookie);
    match (peer_cookie, home::home_dir()) {
        (Some(p), Some(home)) => assert_eq!(p, home.join("server.cookie")),
        (p, None) => assert_eq!(p, Some("~/server.cookie".into())),
        (None, _) => panic!("cookie path went missing"),
    }
    Ok(())
}
