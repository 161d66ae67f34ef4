use node_probe_rs::parser::{parse, parse_all};
use node_probe_rs::types::Protocol;

#[test]
fn vless_scenario_parses_host_port_and_name() {
    let node = parse("vless://uuid@1.2.3.4:443#HK-Node");
    assert_eq!(node.protocol, Protocol::Vless);
    assert_eq!(node.host, "1.2.3.4");
    assert_eq!(node.port, Some(443));
    assert_eq!(node.display_name, "HK-Node");
}

#[test]
fn every_usable_descriptor_has_a_valid_port() {
    let inputs = [
        "vless://a@h1.example:1#a",
        "trojan://b@h2.example#b",
        "ss://YWVzLTI1Ni1nY206cGFzcw@h3.example:65535#c",
        "hy2://c@h4.example:8443",
        "vless://d@h5.example:65536#too-big",
        "vless://e@:443#no-host",
        "garbage",
        "",
    ];
    for node in parse_all(inputs) {
        if let Some((host, port)) = node.target() {
            assert!(!host.is_empty());
            assert!(port >= 1);
        } else {
            assert!(node.host.is_empty() || node.port.is_none());
        }
    }
}

#[test]
fn malformed_input_is_preserved_verbatim() {
    let node = parse("vmess://%%%");
    assert_eq!(node.protocol, Protocol::Unknown);
    assert_eq!(node.raw_descriptor, "vmess://%%%");
    assert!(node.target().is_none());
}
