use hmac::{Hmac, Mac};

type HmacSha1 = Hmac<::sha1::Sha1>;

/// HMAC-SHA1 as used by the STUN MESSAGE-INTEGRITY attribute.
#[derive(Clone)]
pub struct Sha1(HmacSha1);

impl Sha1 {
    pub fn hmac(mut self, payloads: &[&[u8]]) -> [u8; 20] {
        for payload in payloads {
            self.0.update(payload);
        }

        let comp = self.0.finalize().into_bytes();
        comp.into()
    }
}

impl From<&[u8]> for Sha1 {
    fn from(value: &[u8]) -> Self {
        // HMAC accepts keys of any length, the error case is unreachable.
        Sha1(HmacSha1::new_from_slice(value).expect("HMAC key of any length"))
    }
}
