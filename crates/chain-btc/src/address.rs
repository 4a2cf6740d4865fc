use std::fmt;
use std::str::FromStr;

use bitcoin::address::{Address, AddressType, NetworkUnchecked};
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::Secp256k1;
use bitcoin::{CompressedPublicKey, PubkeyHash, PublicKey, Script, ScriptBuf, WPubkeyHash};
use serde::{Deserialize, Serialize};

use crate::error::BtcError;
use crate::network::BtcNetwork;

/// Address script families. The set is fixed by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressFormat {
    /// P2PKH, Base58Check.
    Legacy,
    /// P2SH, Base58Check. Produced for P2SH-wrapped P2WPKH on conversion.
    ScriptHash,
    /// P2WPKH / P2WSH, bech32.
    WitnessV0,
    /// P2TR, bech32m.
    Taproot,
}

impl FromStr for AddressFormat {
    type Err = BtcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "p2pkh" | "legacy" => Ok(AddressFormat::Legacy),
            "p2sh" | "p2sh_p2wpkh" | "script_hash" => Ok(AddressFormat::ScriptHash),
            "p2wpkh" | "p2wsh" | "segwit" | "witness_v0" => Ok(AddressFormat::WitnessV0),
            "p2tr" | "taproot" | "witness_v1" => Ok(AddressFormat::Taproot),
            other => Err(BtcError::UnsupportedFormat(format!(
                "unknown address format: {other}"
            ))),
        }
    }
}

/// A Bitcoin address of one of the supported formats.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BtcAddress {
    network: BtcNetwork,
    format: AddressFormat,
    inner: Address,
}

impl BtcAddress {
    /// Wrap a checked address, rejecting types outside [`AddressFormat`]
    /// (future witness versions, pay-to-anchor).
    fn new(inner: Address, network: BtcNetwork) -> Result<Self, BtcError> {
        let format = match inner.address_type() {
            Some(AddressType::P2pkh) => AddressFormat::Legacy,
            Some(AddressType::P2sh) => AddressFormat::ScriptHash,
            Some(AddressType::P2wpkh) | Some(AddressType::P2wsh) => AddressFormat::WitnessV0,
            Some(AddressType::P2tr) => AddressFormat::Taproot,
            _ => {
                return Err(BtcError::InvalidAddress(format!(
                    "unsupported address type: {inner}"
                )))
            }
        };
        Ok(Self {
            network,
            format,
            inner,
        })
    }

    pub fn network(&self) -> BtcNetwork {
        self.network
    }

    pub fn format(&self) -> AddressFormat {
        self.format
    }

    /// Canonical string form (bech32 is always lowercase).
    pub fn encode(&self) -> String {
        self.to_string()
    }

    /// Whether the prefix/HRP of this address is the one `network` uses.
    /// Testnet and signet share all prefixes; regtest shares Base58 ones.
    pub fn is_valid_for_network(&self, network: BtcNetwork) -> bool {
        self.inner
            .as_unchecked()
            .is_valid_for_network(network.to_bitcoin_network())
    }

    /// The locking script paying to this address.
    pub fn script_pubkey(&self) -> ScriptBuf {
        self.inner.script_pubkey()
    }

    /// Recover the address a standard locking script pays to.
    pub fn from_script(script: &Script, network: BtcNetwork) -> Result<Self, BtcError> {
        let inner = Address::from_script(script, network.to_bitcoin_network())
            .map_err(|e| BtcError::UnsupportedFormat(format!("script has no address form: {e}")))?;
        Self::new(inner, network).map_err(|e| BtcError::UnsupportedFormat(e.to_string()))
    }

    /// The public key hash this address commits to, for P2PKH and P2WPKH.
    fn key_hash(&self) -> Option<PubkeyHash> {
        if let Some(hash) = self.inner.pubkey_hash() {
            return Some(hash);
        }
        let program = self.inner.witness_program().filter(|p| p.is_p2wpkh())?;
        PubkeyHash::from_slice(program.program().as_bytes()).ok()
    }
}

impl fmt::Display for BtcAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl FromStr for BtcAddress {
    type Err = BtcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode(s)
    }
}

/// Decode an address string, identifying its format and network from its
/// prefix alone. Shared test-network prefixes decode as testnet.
pub fn decode(address: &str) -> Result<BtcAddress, BtcError> {
    let unchecked: Address<NetworkUnchecked> = address
        .parse()
        .map_err(|e| BtcError::InvalidAddress(format!("failed to parse address: {e}")))?;

    let network = [BtcNetwork::Mainnet, BtcNetwork::Testnet, BtcNetwork::Regtest]
        .into_iter()
        .find(|n| unchecked.is_valid_for_network(n.to_bitcoin_network()))
        .ok_or_else(|| {
            BtcError::InvalidAddress(format!("{address} belongs to no supported network"))
        })?;

    let checked = unchecked
        .require_network(network.to_bitcoin_network())
        .map_err(|e| BtcError::InvalidAddress(e.to_string()))?;
    BtcAddress::new(checked, network)
}

/// Validate an address string against an asserted format and network.
///
/// Returns `false` for undecodable strings, for a format other than
/// `expected`, and for addresses belonging to another network.
pub fn validate_address(address: &str, expected: AddressFormat, network: BtcNetwork) -> bool {
    match decode(address) {
        Ok(decoded) => decoded.format() == expected && decoded.is_valid_for_network(network),
        Err(_) => false,
    }
}

/// Derive an address of `format` from a serialized secp256k1 public key.
///
/// Segwit formats require a compressed key. Taproot uses the key as the
/// BIP-86 internal key (key-path only, no script tree).
pub fn address_from_public_key(
    pubkey_bytes: &[u8],
    format: AddressFormat,
    network: BtcNetwork,
) -> Result<BtcAddress, BtcError> {
    let public_key = PublicKey::from_slice(pubkey_bytes)
        .map_err(|e| BtcError::InvalidRequest(format!("failed to parse public key: {e}")))?;

    let compressed = || {
        CompressedPublicKey::from_slice(pubkey_bytes).map_err(|_| {
            BtcError::UnsupportedFormat(format!(
                "{format:?} address requires a compressed public key"
            ))
        })
    };

    let net = network.to_bitcoin_network();
    let inner = match format {
        AddressFormat::Legacy => Address::p2pkh(public_key.pubkey_hash(), net),
        AddressFormat::WitnessV0 => Address::p2wpkh(&compressed()?, net),
        AddressFormat::ScriptHash => Address::p2shwpkh(&compressed()?, net),
        AddressFormat::Taproot => {
            let secp = Secp256k1::verification_only();
            let (internal_key, _parity) = compressed()?.0.x_only_public_key();
            Address::p2tr(&secp, internal_key, None, net)
        }
    };
    BtcAddress::new(inner, network)
}

/// Convert `source` into an address of `format`.
///
/// `source` is either a hex public key or an address that commits to a key
/// hash (P2PKH or P2WPKH); the key hash is re-wrapped in the requested format.
/// A bare key hash cannot produce a taproot address.
pub fn convert_address(
    source: &str,
    format: AddressFormat,
    network: BtcNetwork,
) -> Result<BtcAddress, BtcError> {
    if let Ok(bytes) = hex::decode(source) {
        if bytes.len() == 33 || bytes.len() == 65 {
            return address_from_public_key(&bytes, format, network);
        }
    }

    let decoded = decode(source)?;
    let key_hash = decoded.key_hash().ok_or_else(|| {
        BtcError::UnsupportedFormat(format!(
            "{:?} address carries no public key hash",
            decoded.format()
        ))
    })?;
    let wpkh = ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array(key_hash.to_byte_array()));

    let net = network.to_bitcoin_network();
    let inner = match format {
        AddressFormat::Legacy => Address::p2pkh(key_hash, net),
        AddressFormat::WitnessV0 => Address::from_script(&wpkh, net)
            .map_err(|e| BtcError::InvalidAddress(e.to_string()))?,
        AddressFormat::ScriptHash => {
            Address::p2sh(&wpkh, net).map_err(|e| BtcError::InvalidAddress(e.to_string()))?
        }
        AddressFormat::Taproot => {
            return Err(BtcError::UnsupportedFormat(
                "taproot address requires the public key, not its hash".into(),
            ))
        }
    };
    BtcAddress::new(inner, network)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::base58;
    use bitcoin::bech32::{segwit, Fe32};

    const GENERATOR_PUBKEY: &str =
        "0279BE667EF9DCBBAC55A06295CE870B07029BFCDB2DCE28D959F2815B16F81798";

    fn generator_bytes() -> Vec<u8> {
        hex::decode(GENERATOR_PUBKEY).unwrap()
    }

    #[test]
    fn genesis_address_is_legacy_and_roundtrips() {
        let addr = decode("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa").unwrap();
        assert_eq!(addr.format(), AddressFormat::Legacy);
        assert_eq!(addr.network(), BtcNetwork::Mainnet);
        assert_eq!(addr.encode(), "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa");
    }

    #[test]
    fn roundtrip_each_format() {
        let cases = [
            ("3J98t1WpEZ73CNmQviecrnyiWrnqRhWNLy", AddressFormat::ScriptHash),
            ("bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4", AddressFormat::WitnessV0),
            (
                "bc1qrp33g0q5c5txsp9arysrx4k6zdkfs4nce4xj0gdcccefvpysxf3qccfmv3",
                AddressFormat::WitnessV0,
            ),
            (
                "bc1p0xlxvlhemja6c4dqv22uapctqupfhlxm9h8z3k2e72q4k9hcz7vqzk5jj0",
                AddressFormat::Taproot,
            ),
            (
                "tb1qrp33g0q5c5txsp9arysrx4k6zdkfs4nce4xj0gdcccefvpysxf3q0sl5k7",
                AddressFormat::WitnessV0,
            ),
        ];
        for (s, format) in cases {
            let addr = decode(s).unwrap();
            assert_eq!(addr.format(), format, "{s}");
            assert_eq!(addr.encode(), s);
        }
    }

    #[test]
    fn uppercase_bech32_canonicalizes_to_lowercase() {
        let upper = "BC1QW508D6QEJXTDG4Y5R3ZARVARY0C5XW7KV8F3T4";
        let addr = decode(upper).unwrap();
        assert_eq!(addr.encode(), upper.to_ascii_lowercase());
    }

    #[test]
    fn regtest_roundtrip() {
        let addr =
            address_from_public_key(&generator_bytes(), AddressFormat::WitnessV0, BtcNetwork::Regtest)
                .unwrap();
        let s = addr.encode();
        assert!(s.starts_with("bcrt1q"));
        assert_eq!(decode(&s).unwrap(), addr);
    }

    #[test]
    fn bad_checksum_is_invalid_address() {
        for s in [
            "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNb",
            "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t5",
        ] {
            assert!(matches!(decode(s), Err(BtcError::InvalidAddress(_))), "{s}");
        }
    }

    #[test]
    fn foreign_version_byte_is_invalid_address() {
        let mut data = vec![0x30];
        data.extend_from_slice(&[1u8; 20]);
        let litecoin_style = base58::encode_check(&data);
        let err = decode(&litecoin_style).unwrap_err();
        assert!(matches!(&err, BtcError::InvalidAddress(m) if m.contains("prefix")), "{err}");
    }

    #[test]
    fn foreign_hrp_is_invalid_address() {
        let ltc = segwit::encode(
            bitcoin::bech32::Hrp::parse("ltc").unwrap(),
            Fe32::Q,
            &[1u8; 20],
        )
        .unwrap();
        assert!(matches!(decode(&ltc), Err(BtcError::InvalidAddress(_))));
    }

    #[test]
    fn wrong_payload_length_is_invalid_address() {
        let mut data = vec![0x00];
        data.extend_from_slice(&[1u8; 19]);
        let short = base58::encode_check(&data);
        let err = decode(&short).unwrap_err();
        assert!(matches!(&err, BtcError::InvalidAddress(m) if m.contains("base58 data")), "{err}");
    }

    #[test]
    fn garbage_never_panics() {
        for s in ["", "bc1", "notanaddress!!!", "tb1p", "1", "bcrt1qqqqq"] {
            assert!(decode(s).is_err(), "{s}");
        }
    }

    #[test]
    fn testnet_address_is_valid_on_signet_not_mainnet() {
        let addr =
            decode("tb1qrp33g0q5c5txsp9arysrx4k6zdkfs4nce4xj0gdcccefvpysxf3q0sl5k7").unwrap();
        assert!(addr.is_valid_for_network(BtcNetwork::Signet));
        assert!(!addr.is_valid_for_network(BtcNetwork::Mainnet));
        assert!(!addr.is_valid_for_network(BtcNetwork::Regtest));
    }

    #[test]
    fn validate_checks_format_and_network() {
        let p2wpkh = "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4";
        assert!(validate_address(p2wpkh, AddressFormat::WitnessV0, BtcNetwork::Mainnet));
        assert!(!validate_address(p2wpkh, AddressFormat::Legacy, BtcNetwork::Mainnet));
        assert!(!validate_address(p2wpkh, AddressFormat::WitnessV0, BtcNetwork::Testnet));
        assert!(!validate_address("garbage", AddressFormat::Legacy, BtcNetwork::Mainnet));
    }

    #[test]
    fn script_pubkey_roundtrip() {
        for s in [
            "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa",
            "3J98t1WpEZ73CNmQviecrnyiWrnqRhWNLy",
            "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4",
            "bc1p0xlxvlhemja6c4dqv22uapctqupfhlxm9h8z3k2e72q4k9hcz7vqzk5jj0",
        ] {
            let addr = decode(s).unwrap();
            let script = addr.script_pubkey();
            let back = BtcAddress::from_script(&script, BtcNetwork::Mainnet).unwrap();
            assert_eq!(back.encode(), s);
        }
    }

    #[test]
    fn taproot_script_pubkey_matches_bip350_vector() {
        let addr =
            decode("bc1p0xlxvlhemja6c4dqv22uapctqupfhlxm9h8z3k2e72q4k9hcz7vqzk5jj0").unwrap();
        assert_eq!(
            hex::encode(addr.script_pubkey().as_bytes()),
            "512079be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798"
        );
    }

    #[test]
    fn future_witness_version_is_rejected() {
        // Witness v2, 16-byte program.
        assert!(matches!(
            decode("bc1zw508d6qejxtdg4y5r3zarvaryvaxxpcs"),
            Err(BtcError::InvalidAddress(_))
        ));
        let v2 = ScriptBuf::from_bytes(vec![0x52, 0x02, 0x75, 0x1e]);
        assert!(matches!(
            BtcAddress::from_script(&v2, BtcNetwork::Mainnet),
            Err(BtcError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn regtest_base58_decodes_as_testnet() {
        let addr = decode("mqwpxxvfv3QbM8PU8uBx2jaNt9btQqvQNx").unwrap();
        assert_eq!(addr.network(), BtcNetwork::Testnet);
        assert!(addr.is_valid_for_network(BtcNetwork::Regtest));
        assert!(!addr.is_valid_for_network(BtcNetwork::Mainnet));
    }

    #[test]
    fn op_return_has_no_address() {
        let script = ScriptBuf::from_bytes(vec![0x6a, 0x01, 0xff]);
        assert!(matches!(
            BtcAddress::from_script(&script, BtcNetwork::Mainnet),
            Err(BtcError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn pubkey_to_p2wpkh_matches_known_vector() {
        let addr =
            address_from_public_key(&generator_bytes(), AddressFormat::WitnessV0, BtcNetwork::Mainnet)
                .unwrap();
        assert_eq!(addr.encode(), "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4");
    }

    #[test]
    fn pubkey_to_legacy_matches_known_vector() {
        let addr =
            address_from_public_key(&generator_bytes(), AddressFormat::Legacy, BtcNetwork::Mainnet)
                .unwrap();
        assert_eq!(addr.encode(), "1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMH");
    }

    #[test]
    fn pubkey_to_taproot_and_nested() {
        let tr =
            address_from_public_key(&generator_bytes(), AddressFormat::Taproot, BtcNetwork::Testnet)
                .unwrap();
        assert!(tr.encode().starts_with("tb1p"));
        assert_eq!(tr.format(), AddressFormat::Taproot);

        // BIP86 first receive key, m/86'/0'/0'/0/0.
        let bip86_internal =
            hex::decode("03cc8a4bc64d897bddc5fbc2f670f7a8ba0b386779106cf1223c6fc5d7cd6fc115")
                .unwrap();
        let tr = address_from_public_key(&bip86_internal, AddressFormat::Taproot, BtcNetwork::Mainnet)
            .unwrap();
        assert_eq!(
            tr.encode(),
            "bc1p5cyxnuxmeuwuvkwfem96lqzszd02n6xdcjrs20cac6yqjjwudpxqkedrcr"
        );

        let nested = address_from_public_key(
            &generator_bytes(),
            AddressFormat::ScriptHash,
            BtcNetwork::Mainnet,
        )
        .unwrap();
        assert!(nested.encode().starts_with('3'));
    }

    #[test]
    fn invalid_pubkey_is_rejected() {
        let result = address_from_public_key(&[0u8; 33], AddressFormat::Legacy, BtcNetwork::Mainnet);
        assert!(matches!(result, Err(BtcError::InvalidRequest(_))));
    }

    #[test]
    fn convert_legacy_to_witness_keeps_key_hash() {
        let converted = convert_address(
            "1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMH",
            AddressFormat::WitnessV0,
            BtcNetwork::Mainnet,
        )
        .unwrap();
        assert_eq!(converted.encode(), "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4");

        let back = convert_address(
            &converted.encode(),
            AddressFormat::Legacy,
            BtcNetwork::Mainnet,
        )
        .unwrap();
        assert_eq!(back.encode(), "1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMH");
    }

    #[test]
    fn convert_pubkey_hex_source() {
        let converted =
            convert_address(GENERATOR_PUBKEY, AddressFormat::WitnessV0, BtcNetwork::Mainnet)
                .unwrap();
        assert_eq!(converted.encode(), "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4");
    }

    #[test]
    fn convert_hash_to_taproot_is_unsupported() {
        let err = convert_address(
            "1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMH",
            AddressFormat::Taproot,
            BtcNetwork::Mainnet,
        )
        .unwrap_err();
        assert!(matches!(err, BtcError::UnsupportedFormat(_)));
    }

    #[test]
    fn convert_script_hash_source_is_unsupported() {
        let err = convert_address(
            "3J98t1WpEZ73CNmQviecrnyiWrnqRhWNLy",
            AddressFormat::WitnessV0,
            BtcNetwork::Mainnet,
        )
        .unwrap_err();
        assert!(matches!(err, BtcError::UnsupportedFormat(_)));
    }

    #[test]
    fn format_names_parse() {
        assert_eq!("p2pkh".parse::<AddressFormat>().unwrap(), AddressFormat::Legacy);
        assert_eq!("P2SH-P2WPKH".parse::<AddressFormat>().unwrap(), AddressFormat::ScriptHash);
        assert_eq!("p2wpkh".parse::<AddressFormat>().unwrap(), AddressFormat::WitnessV0);
        assert_eq!("p2tr".parse::<AddressFormat>().unwrap(), AddressFormat::Taproot);
        assert!(matches!(
            "p2pk".parse::<AddressFormat>(),
            Err(BtcError::UnsupportedFormat(_))
        ));
    }
}
