use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{
    de::{self, Visitor},
    Deserialize, Deserializer, Serialize, Serializer,
};

/// The category of a wallet transaction.
///
/// This is one of the results of the `listtransactions` and
/// `gettransaction` RPC methods.
///
/// # Note
///
/// Legacy wallets emit further categories (`move`, ...); anything
/// unrecognised maps to [`TransactionCategory::Other`] instead of
/// failing the whole listing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionCategory {
    /// Transactions sent.
    Send,
    /// Non-coinbase transactions received.
    Receive,
    /// Coinbase transactions received with enough confirmations.
    Generate,
    /// Coinbase transactions that are still immature.
    Immature,
    /// Orphaned coinbase transactions received.
    Orphan,
    /// Any category this crate does not act on.
    #[serde(other)]
    Other,
}

/// Models the result of JSON-RPC method `listunspent`.
///
/// # Note
///
/// Older ABCMint nodes omit the `address` field for outputs the
/// wallet cannot attribute, so it stays optional here.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ListUnspentEntry {
    /// The transaction id.
    pub txid: String,
    /// The vout value.
    pub vout: u32,
    /// The receiving address, when the wallet knows it.
    pub address: Option<String>,
    /// The account label, if any.
    pub account: Option<String>,
    /// The script pubkey hex.
    #[serde(rename = "scriptPubKey")]
    pub script_pub_key: Option<String>,
    /// The output amount in coins.
    #[serde(deserialize_with = "deserialize_amount")]
    pub amount: Decimal,
    /// The number of confirmations (0 for mempool entries).
    #[serde(default)]
    pub confirmations: i64,
    /// Whether we have the keys to spend this output.
    pub spendable: Option<bool>,
}

/// Result of JSON-RPC method `gettransaction` (wallet view).
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct WalletTransaction {
    /// The signed net amount in coins.
    #[serde(default, deserialize_with = "deserialize_opt_amount")]
    pub amount: Option<Decimal>,
    /// The number of confirmations (0 while in the mempool).
    #[serde(default)]
    pub confirmations: i64,
    /// The hash of the containing block, once mined.
    pub blockhash: Option<String>,
    /// The transaction id.
    pub txid: String,
    /// Receive time, Unix epoch seconds.
    pub time: Option<u64>,
    /// Per-address breakdown.
    #[serde(default)]
    pub details: Vec<TransactionDetail>,
    /// The raw transaction hex, when the node includes it.
    pub hex: Option<String>,
}

/// One entry of the `details` array of `gettransaction`.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct TransactionDetail {
    pub account: Option<String>,
    pub address: Option<String>,
    pub category: TransactionCategory,
    #[serde(deserialize_with = "deserialize_amount")]
    pub amount: Decimal,
    #[serde(default, deserialize_with = "deserialize_opt_amount")]
    pub fee: Option<Decimal>,
}

/// Models one entry of the result of JSON-RPC method `listtransactions`.
///
/// # Note
///
/// The `amount` is signed: negative for [`TransactionCategory::Send`],
/// positive for the receiving categories.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ListTransactionsEntry {
    pub account: Option<String>,
    /// The counterparty address, when attributable.
    pub address: Option<String>,
    /// Category of the transaction.
    pub category: TransactionCategory,
    /// The signed amount in coins.
    #[serde(deserialize_with = "deserialize_amount")]
    pub amount: Decimal,
    /// The number of confirmations.
    pub confirmations: Option<i64>,
    /// The transaction id.
    pub txid: Option<String>,
    /// Receive time, Unix epoch seconds.
    pub time: Option<u64>,
}

/// Result of JSON-RPC method `validateaddress`.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ValidateAddress {
    #[serde(rename = "isvalid")]
    pub is_valid: bool,
    /// The validated address, echoed back.
    pub address: Option<String>,
    #[serde(rename = "ismine")]
    pub is_mine: Option<bool>,
}

/// Result of the legacy JSON-RPC method `getinfo`.
///
/// Only the fields this crate acts on are modelled; ABCMint keeps the
/// pre-0.16 Bitcoin shape.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct GetInfo {
    /// Wallet balance in coins.
    #[serde(default, deserialize_with = "deserialize_opt_amount")]
    pub balance: Option<Decimal>,
    /// Current block height.
    #[serde(default)]
    pub blocks: u64,
    /// Peer connection count.
    pub connections: Option<u32>,
    /// Proof-of-work difficulty.
    pub difficulty: Option<f64>,
    /// The wallet's configured pay-tx-fee rate, coins per kB.
    #[serde(default, deserialize_with = "deserialize_opt_amount")]
    pub paytxfee: Option<Decimal>,
    /// Unix timestamp until which the wallet is unlocked, 0 when
    /// locked. Absent for unencrypted wallets.
    pub unlocked_until: Option<i64>,
}

/// One entry of the result of JSON-RPC method `getpeerinfo`.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct PeerInfo {
    /// The peer's address and port.
    pub addr: Option<String>,
    /// The peer's advertised subversion string.
    pub subver: Option<String>,
}

/// Result of JSON-RPC method `signrawtransaction`.
///
/// # Note
///
/// Some ABCMint node builds answer with the signed hex string
/// directly instead of the `{hex, complete}` object; both forms are
/// accepted.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum SignRawReply {
    Signed { hex: String, complete: Option<bool> },
    Hex(String),
}

impl SignRawReply {
    /// The signed transaction hex, whichever reply form arrived.
    pub fn into_hex(self) -> String {
        match self {
            SignRawReply::Signed { hex, .. } => hex,
            SignRawReply::Hex(hex) => hex,
        }
    }
}

/// Result of JSON-RPC methods `decoderawtransaction` and
/// `getrawtransaction` with verbosity 1.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct DecodedTransaction {
    pub txid: Option<String>,
    /// The transaction version.
    #[serde(default)]
    pub version: i64,
    /// The transaction locktime.
    #[serde(default)]
    pub locktime: u64,
    #[serde(default)]
    pub vin: Vec<DecodedInput>,
    #[serde(default)]
    pub vout: Vec<DecodedOutput>,
    /// Confirmations; only present on the `getrawtransaction` form.
    pub confirmations: Option<i64>,
    /// Containing block; only present on the `getrawtransaction` form.
    pub blockhash: Option<String>,
}

/// One input of a decoded transaction.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct DecodedInput {
    /// The spent output's transaction id. Absent for coinbase inputs.
    pub txid: Option<String>,
    /// The spent output's index.
    pub vout: Option<u32>,
    /// The input sequence number.
    #[serde(default)]
    pub sequence: u64,
}

/// One output of a decoded transaction.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct DecodedOutput {
    /// The output value in coins.
    #[serde(deserialize_with = "deserialize_amount")]
    pub value: Decimal,
    /// The output index.
    #[serde(default)]
    pub n: u32,
    /// The output script.
    #[serde(rename = "scriptPubKey")]
    pub script_pub_key: DecodedScript,
}

/// The script half of a decoded output.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct DecodedScript {
    pub asm: Option<String>,
    pub hex: Option<String>,
    /// The script class, e.g. `pubkeyhash`.
    #[serde(rename = "type")]
    pub script_type: Option<String>,
    /// Required signatures for multisig scripts.
    #[serde(rename = "reqSigs")]
    pub req_sigs: Option<i64>,
    /// Addresses the script pays to.
    pub addresses: Option<Vec<String>>,
}

/// Models the input half of JSON-RPC method `createrawtransaction`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct TxInput {
    pub txid: String,
    pub vout: u32,
}

/// The output half of `createrawtransaction`: an insertion-ordered
/// address → amount accumulator.
///
/// Repeated credits to the same address accumulate (the service-fee
/// address may legitimately appear more than once while a
/// transaction is assembled), and every stored amount stays
/// quantised to 1e-8.
///
/// # Note
///
/// Serialises as a JSON object whose values are *decimal strings*,
/// never floats, so no precision is lost on the wire.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OutputList(Vec<(String, Decimal)>);

impl OutputList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `amount` to the address's output, creating it if absent.
    pub fn credit(&mut self, address: &str, amount: Decimal) {
        if let Some(entry) = self.0.iter_mut().find(|(a, _)| a == address) {
            entry.1 = (entry.1 + amount).round_dp(8);
        } else {
            self.0.push((address.to_string(), amount.round_dp(8)));
        }
    }

    /// Overwrites the address's output value.
    pub fn set(&mut self, address: &str, amount: Decimal) {
        if let Some(entry) = self.0.iter_mut().find(|(a, _)| a == address) {
            entry.1 = amount.round_dp(8);
        } else {
            self.0.push((address.to_string(), amount.round_dp(8)));
        }
    }

    pub fn get(&self, address: &str) -> Option<Decimal> {
        self.0.iter().find(|(a, _)| a == address).map(|(_, v)| *v)
    }

    /// The first output added; the deduction splice falls back to it
    /// when no primary hint is available.
    pub fn first_address(&self) -> Option<&str> {
        self.0.first().map(|(a, _)| a.as_str())
    }

    pub fn contains(&self, address: &str) -> bool {
        self.0.iter().any(|(a, _)| a == address)
    }

    /// Sum of all output values.
    pub fn total(&self) -> Decimal {
        self.0.iter().map(|(_, v)| *v).sum()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Decimal)> {
        self.0.iter().map(|(a, v)| (a.as_str(), *v))
    }
}

impl Serialize for OutputList {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (address, amount) in &self.0 {
            map.serialize_entry(address, &amount.to_string())?;
        }
        map.end()
    }
}

/// A bare decimal RPC return value (e.g. `getreceivedbyaddress`),
/// arriving as either a JSON number or a string.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Coins(pub Decimal);

impl<'de> Deserialize<'de> for Coins {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserialize_amount(deserializer).map(Coins)
    }
}

/// Deserializes a coin amount into an exact [`Decimal`].
///
/// Wire floats are routed through their shortest display form so
/// `0.1` arrives as the decimal `0.1` and not a binary artefact.
pub(crate) fn deserialize_amount<'d, D>(deserializer: D) -> Result<Decimal, D::Error>
where
    D: Deserializer<'d>,
{
    struct AmountVisitor;

    impl Visitor<'_> for AmountVisitor {
        type Value = Decimal;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            write!(formatter, "a numeric or string coin amount expected")
        }

        fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Decimal::from_str(&v.to_string()).map_err(E::custom)
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Decimal::from(v))
        }

        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Decimal::from(v))
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Decimal::from_str(v).map_err(E::custom)
        }
    }
    deserializer.deserialize_any(AmountVisitor)
}

/// Optional-field variant of [`deserialize_amount`].
pub(crate) fn deserialize_opt_amount<'d, D>(
    deserializer: D,
) -> Result<Option<Decimal>, D::Error>
where
    D: Deserializer<'d>,
{
    let opt: Option<Coins> = Option::deserialize(deserializer)?;
    Ok(opt.map(|c| c.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn listunspent_float_amount_is_exact() {
        let json = r#"{
            "txid": "aa11",
            "vout": 1,
            "address": "8Pabc",
            "scriptPubKey": "76a914",
            "amount": 0.1,
            "confirmations": 3
        }"#;
        let entry: ListUnspentEntry = serde_json::from_str(json).unwrap();
        assert_eq!(entry.amount, dec!(0.1));
        assert_eq!(entry.amount.to_string(), "0.1");
    }

    #[test]
    fn listunspent_string_amount_is_accepted() {
        let json = r#"{"txid":"aa","vout":0,"amount":"12.34567891","confirmations":0}"#;
        let entry: ListUnspentEntry = serde_json::from_str(json).unwrap();
        assert_eq!(entry.amount, dec!(12.34567891));
    }

    #[test]
    fn unknown_category_maps_to_other() {
        let json = r#"{"category":"move","amount":1,"txid":"ab"}"#;
        let entry: ListTransactionsEntry = serde_json::from_str(json).unwrap();
        assert_eq!(entry.category, TransactionCategory::Other);
    }

    #[test]
    fn signraw_reply_accepts_both_forms() {
        let object: SignRawReply =
            serde_json::from_str(r#"{"hex":"00ab","complete":true}"#).unwrap();
        assert_eq!(object.into_hex(), "00ab");

        let bare: SignRawReply = serde_json::from_str(r#""00cd""#).unwrap();
        assert_eq!(bare.into_hex(), "00cd");
    }

    #[test]
    fn output_list_accumulates_and_serialises_strings() {
        let mut outputs = OutputList::new();
        outputs.credit("8Pfee", dec!(0.5));
        outputs.credit("8Pdest", dec!(1.25));
        outputs.credit("8Pfee", dec!(0.25));

        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs.first_address(), Some("8Pfee"));
        assert_eq!(outputs.get("8Pfee"), Some(dec!(0.75)));
        assert_eq!(outputs.total(), dec!(2.0));

        let json = serde_json::to_value(&outputs).unwrap();
        assert_eq!(json["8Pfee"], "0.75");
        assert_eq!(json["8Pdest"], "1.25");
    }

    #[test]
    fn decoded_transaction_parses_script_fields() {
        let json = r#"{
            "txid": "dd",
            "version": 101,
            "locktime": 0,
            "vin": [{"txid": "cc", "vout": 0, "sequence": 4294967295}],
            "vout": [{
                "value": 9.99,
                "n": 0,
                "scriptPubKey": {"type": "multisig", "reqSigs": 2, "addresses": ["8Pa", "8Pb"]}
            }]
        }"#;
        let tx: DecodedTransaction = serde_json::from_str(json).unwrap();
        assert_eq!(tx.version, 101);
        assert_eq!(tx.vin[0].sequence, 0xffff_ffff);
        let script = &tx.vout[0].script_pub_key;
        assert_eq!(script.script_type.as_deref(), Some("multisig"));
        assert_eq!(script.req_sigs, Some(2));
    }
}
