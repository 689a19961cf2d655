//! Calls the client issues during key exchange and session upkeep.
//!
//! Response types are listed after the arrow; `Deserializable` for the
//! calls themselves only exists with the `deserializable-functions`
//! feature.

use crate::enums;

tl_function! {
    /// Opens the key exchange.
    ReqPq = 0x60469778 -> enums::ResPq {
        nonce: [u8; 16],
    }
}

tl_function! {
    ReqDhParams = 0xd712e4be -> enums::ServerDhParams {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        p: Vec<u8>,
        q: Vec<u8>,
        public_key_fingerprint: i64,
        encrypted_data: Vec<u8>,
    }
}

tl_function! {
    SetClientDhParams = 0xf5045f1f -> enums::SetClientDhParamsAnswer {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        encrypted_data: Vec<u8>,
    }
}

tl_function! {
    Ping = 0x7abe77ec -> enums::Pong {
        ping_id: i64,
    }
}

tl_function! {
    /// Ping that also asks the server to drop the connection after
    /// `disconnect_delay` seconds of silence.
    PingDelayDisconnect = 0xf3427b8c -> enums::Pong {
        ping_id: i64,
        disconnect_delay: i32,
    }
}

tl_function! {
    /// HTTP long-poll: hold the response for up to `max_wait` ms.
    HttpWait = 0x9299359f -> crate::Blob {
        max_delay: i32,
        wait_after: i32,
        max_wait: i32,
    }
}
