use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
};

/// Ephemeral PKI for one port-forward session: a CA, a server leaf whose SAN
/// is the external host, and a client leaf. Everything is PEM; nothing is
/// ever written to disk.
pub struct TunnelPki {
    pub ca_cert: String,
    pub server_cert: String,
    pub server_key: String,
    pub client_cert: String,
    pub client_key: String,
}

pub fn generate(external_host: &str) -> Result<TunnelPki, rcgen::Error> {
    let mut ca_params = CertificateParams::new(Vec::<String>::new())?;
    ca_params.distinguished_name = distinguished_name("Tanjun Port Forward CA");
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
    ];

    let ca_key = KeyPair::generate()?;
    let ca_cert = ca_params.self_signed(&ca_key)?;

    let (server_cert, server_key) = issue_leaf(&ca_cert, &ca_key, external_host)?;
    let (client_cert, client_key) = issue_leaf(&ca_cert, &ca_key, "client")?;

    Ok(TunnelPki {
        ca_cert: ca_cert.pem(),
        server_cert,
        server_key,
        client_cert,
        client_key,
    })
}

fn issue_leaf(
    ca_cert: &Certificate,
    ca_key: &KeyPair,
    name: &str,
) -> Result<(String, String), rcgen::Error> {
    let mut params = CertificateParams::new(vec![name.to_string()])?;
    params.distinguished_name = distinguished_name(name);
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];

    let key = KeyPair::generate()?;
    let cert = params.signed_by(&key, ca_cert, ca_key)?;

    Ok((cert.pem(), key.serialize_pem()))
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, "Tanjun");
    dn.push(DnType::CommonName, common_name);
    dn
}
