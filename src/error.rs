//! Per-module error types, one `error_chain!` block each, following the split that
//! `bip_select` uses (`DiscoveryError`/`RevealError`/`UberError`) rather than one crate-wide enum.

error_chain! {
    types {
        DelegateError, DelegateErrorKind, DelegateResultExt, DelegateResult;
    }

    errors {
        UnknownTransfer {
            index: u32
        } {
            description("Transfer Handle Does Not Exist")
            display("Transfer Handle For Piece {} Does Not Exist", index)
        }
        PieceOutOfRange {
            index: u32,
            total: u32
        } {
            description("Piece Index Was Out Of Range")
            display("Piece Index {} Was Out Of Range (Total: {})", index, total)
        }
    }
}

error_chain! {
    types {
        ThrottleError, ThrottleErrorKind, ThrottleResultExt, ThrottleResult;
    }

    errors {
        UnknownNode {
            id: u64
        } {
            description("Throttle Node Is Not Registered With This List")
            display("Throttle Node {} Is Not Registered With This List", id)
        }
    }
}

error_chain! {
    types {
        ChokeError, ChokeErrorKind, ChokeResultExt, ChokeResult;
    }

    errors {
        UnknownPeer {
            id: u64
        } {
            description("Peer Is Not Tracked By This Choke Queue")
            display("Peer {} Is Not Tracked By This Choke Queue", id)
        }
        QuotaExceeded {
            requested: u32,
            available: u32
        } {
            description("Requested More Unchoke Slots Than The Global Quota Allows")
            display("Requested {} Unchoke Slots But Only {} Are Available", requested, available)
        }
    }
}

error_chain! {
    types {
        ConnectionError, ConnectionErrorKind, ConnectionResultExt, ConnectionResult;
    }

    errors {
        /// Peer sent a protocol violation: close the connection but do not treat it as a bug.
        CommunicationError {
            reason: String
        } {
            description("Peer Violated The Wire Protocol")
            display("Peer Violated The Wire Protocol: {}", reason)
        }
        /// Transport level error (would come from the socket layer, out of scope here).
        NetworkError {
            reason: String
        } {
            description("Network Transport Failed")
            display("Network Transport Failed: {}", reason)
        }
        /// Disk I/O failure, surfaced up to the torrent owner.
        StorageError {
            reason: String
        } {
            description("Storage Layer Failed")
            display("Storage Layer Failed: {}", reason)
        }
        /// Control-flow signal, not an error: the caller should tear the connection down quietly.
        CloseConnection {
            description("Connection Requested To Close")
            display("Connection Requested To Close")
        }
    }
}
