use crate::*;

use veil_core::config::VeilConfig;

/// A node brought up entirely from a config file.
#[tokio::test]
async fn test_link_layer_from_config_file() -> Result<()> {
    init_tracing();
    let dir = scratch_dir("config");
    std::fs::create_dir_all(&dir)?;
    let keyfile = dir.join("transport.key");
    let config_path = dir.join("config.toml");
    std::fs::write(
        &config_path,
        format!(
            r#"
[identity]
transport_keyfile = "{}"

[network]
interface = "lo"
family = "inet"
port = 0
rank = 3
"#,
            keyfile.display()
        ),
    )?;

    let config = VeilConfig::from_file(&config_path)?;
    assert_eq!(config.paths.num_paths, 4);

    let link = LinkLayer::from_config(PlainDialect::new(), &config.network)?;
    link.setup_keys(&config.identity)?;
    assert!(keyfile.exists());

    let ai = link.our_address_info()?;
    assert_eq!(ai.rank, 3);
    assert_eq!(ai.dialect, DIALECT);
    assert_eq!(ai.pubkey, link.transport_pubkey());
    assert!(ai.socket_addr().ip().is_loopback());

    // a second node on the same key file has the same identity
    let again = LinkLayer::from_config(PlainDialect::new(), &config.network)?;
    again.setup_keys(&config.identity)?;
    assert_eq!(again.transport_pubkey(), link.transport_pubkey());
    assert_ne!(again.local_addr(), link.local_addr());

    let _ = std::fs::remove_dir_all(&dir);
    Ok(())
}

#[test]
fn test_unknown_interface_fails_to_configure() {
    let link = LinkLayer::new(PlainDialect::new(), 1);
    let err = link
        .configure("veil-missing0", AddressFamily::Inet, 0)
        .unwrap_err();
    assert!(matches!(err, LinkError::InterfaceNotFound { .. }), "{err}");
    assert!(link.local_addr().is_none());
}
