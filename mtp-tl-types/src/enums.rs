//! Boxed types: one `enum` per TL type, one variant per constructor.

use crate::types;

tl_enum! {
    ResPq { ResPq(types::ResPq) }
}

tl_enum! {
    /// Answer to `req_DH_params`.
    ServerDhParams {
        Fail(types::ServerDhParamsFail),
        Ok(types::ServerDhParamsOk),
    }
}

tl_enum! {
    ServerDhInnerData { ServerDhInnerData(types::ServerDhInnerData) }
}

tl_enum! {
    /// Answer to `set_client_DH_params`.
    SetClientDhParamsAnswer {
        DhGenOk(types::DhGenOk),
        DhGenRetry(types::DhGenRetry),
        DhGenFail(types::DhGenFail),
    }
}

tl_enum! {
    /// Server complaints about a message the client sent.
    BadMsgNotification {
        BadMsgNotification(types::BadMsgNotification),
        BadServerSalt(types::BadServerSalt),
    }
}

tl_enum! {
    MsgDetailedInfo {
        MsgDetailedInfo(types::MsgDetailedInfo),
        MsgNewDetailedInfo(types::MsgNewDetailedInfo),
    }
}

tl_enum! {
    Pong { Pong(types::Pong) }
}
