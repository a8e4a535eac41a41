//! detached RS256 JSON web signatures

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::{crypto, Algorithm, DecodingKey, EncodingKey};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::json;
use crate::sig::scope::SignMatch;

/// `#spec` of a signature document
pub const PVS_SPEC: &str = "pvs@1";
pub const PVS_TYPE: &str = "PVS";

const RESERVED_HEADERS: [&str; 5] = ["alg", "typ", "jwk", "x5c", "pvs"];

/// what gets written to `pvs.json`; the payload is not embedded
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetachedJws {
    #[serde(rename = "#spec")]
    pub spec: String,
    pub protected: String,
    pub signature: String,
}

impl DetachedJws {
    pub fn from_value(value: Value) -> Result<Self> {
        let jws: DetachedJws =
            serde_json::from_value(value).map_err(|e| Error::json("signature document", e))?;
        if jws.spec != PVS_SPEC {
            return Err(Error::Signature(format!("unsupported signature spec {:?}", jws.spec)));
        }
        Ok(jws)
    }

    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("#spec".into(), Value::String(self.spec.clone()));
        map.insert("protected".into(), Value::String(self.protected.clone()));
        map.insert("signature".into(), Value::String(self.signature.clone()));
        Value::Object(map)
    }

    /// attached form, with the payload filled back in
    pub fn with_payload(&self, payload: &[u8]) -> Value {
        let mut value = self.to_value();
        value["payload"] = Value::String(URL_SAFE_NO_PAD.encode(payload));
        value
    }

    pub fn header(&self) -> Result<ProtectedHeader> {
        let raw = URL_SAFE_NO_PAD
            .decode(&self.protected)
            .map_err(|e| Error::Signature(format!("protected header is not base64url: {e}")))?;
        ProtectedHeader::from_map(json::parse_object(&raw, "protected header")?)
    }

    /// check the signature over `payload` with `key`
    pub fn verify(&self, payload: &[u8], key: &DecodingKey) -> Result<()> {
        let header = self.header()?;
        if header.alg != "RS256" {
            return Err(Error::Signature(format!("unsupported algorithm {}", header.alg)));
        }
        let input = signing_input(&self.protected, payload);
        if crypto::verify(&self.signature, input.as_bytes(), key, Algorithm::RS256)? {
            Ok(())
        } else {
            Err(Error::Signature("signature does not match payload".into()))
        }
    }
}

/// public half of the signing key, as embedded in the header
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    pub n: String,
    pub e: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProtectedHeader {
    pub alg: String,
    pub typ: String,
    pub jwk: Option<Jwk>,
    pub x5c: Option<Vec<String>>,
    pub pvs: SignMatch,
    pub extra: Map<String, Value>,
}

impl ProtectedHeader {
    pub fn new(pvs: SignMatch) -> Self {
        Self {
            alg: "RS256".into(),
            typ: PVS_TYPE.into(),
            jwk: None,
            x5c: None,
            pvs,
            extra: Map::new(),
        }
    }

    pub fn with_extra(mut self, extra: &Map<String, Value>) -> Result<Self> {
        for (key, value) in extra {
            if RESERVED_HEADERS.contains(&key.as_str()) {
                return Err(Error::Malformed {
                    what: "signature header",
                    message: format!("{key:?} cannot be overridden"),
                });
            }
            self.extra.insert(key.clone(), value.clone());
        }
        Ok(self)
    }

    pub fn to_value(&self) -> Result<Value> {
        let mut map = self.extra.clone();
        map.insert("alg".into(), Value::String(self.alg.clone()));
        map.insert("typ".into(), Value::String(self.typ.clone()));
        if let Some(jwk) = &self.jwk {
            map.insert("jwk".into(), serde_json::to_value(jwk).map_err(|e| Error::json("jwk", e))?);
        }
        if let Some(x5c) = &self.x5c {
            map.insert("x5c".into(), Value::from(x5c.clone()));
        }
        map.insert(
            "pvs".into(),
            serde_json::to_value(&self.pvs).map_err(|e| Error::json("pvs", e))?,
        );
        Ok(Value::Object(map))
    }

    fn from_map(mut map: Map<String, Value>) -> Result<Self> {
        fn take<T: serde::de::DeserializeOwned>(
            map: &mut Map<String, Value>,
            key: &str,
        ) -> Result<Option<T>> {
            map.remove(key)
                .map(|v| serde_json::from_value(v).map_err(|e| Error::json(format!("header {key}"), e)))
                .transpose()
        }

        let alg = take::<String>(&mut map, "alg")?
            .ok_or_else(|| Error::Signature("header has no alg".into()))?;
        let typ = take::<String>(&mut map, "typ")?.unwrap_or_default();
        let jwk = take(&mut map, "jwk")?;
        let x5c = take(&mut map, "x5c")?;
        let pvs = take(&mut map, "pvs")?
            .ok_or_else(|| Error::Signature("header has no pvs selector".into()))?;
        Ok(Self {
            alg,
            typ,
            jwk,
            x5c,
            pvs,
            extra: map,
        })
    }
}

fn signing_input(protected: &str, payload: &[u8]) -> String {
    format!("{protected}.{}", URL_SAFE_NO_PAD.encode(payload))
}

/// RS256 private key plus its public jwk
pub struct SigningKey {
    encoding: EncodingKey,
    jwk: Jwk,
}

impl SigningKey {
    /// pkcs#8 or pkcs#1 pem
    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(pem)
            .map_err(|_| Error::Signature("private key is not pem text".into()))?;
        let key = RsaPrivateKey::from_pkcs8_pem(text)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(text))
            .map_err(|e| Error::Signature(format!("cannot read rsa private key: {e}")))?;
        let jwk = Jwk {
            kty: "RSA".into(),
            n: URL_SAFE_NO_PAD.encode(key.n().to_bytes_be()),
            e: URL_SAFE_NO_PAD.encode(key.e().to_bytes_be()),
        };
        Ok(Self {
            encoding: EncodingKey::from_rsa_pem(pem)?,
            jwk,
        })
    }

    pub fn jwk(&self) -> &Jwk {
        &self.jwk
    }

    /// sign `payload` under `header`, embedding the jwk
    pub fn sign_detached(&self, mut header: ProtectedHeader, payload: &[u8]) -> Result<DetachedJws> {
        header.jwk = Some(self.jwk.clone());
        let protected = URL_SAFE_NO_PAD.encode(json::to_canonical_vec(&header.to_value()?));
        let input = signing_input(&protected, payload);
        let signature = crypto::sign(input.as_bytes(), &self.encoding, Algorithm::RS256)?;
        Ok(DetachedJws {
            spec: PVS_SPEC.into(),
            protected,
            signature,
        })
    }
}
