use crate::container::ContainerError;
use crate::formats::cnmt::CnmtError;
use crate::formats::nca::NcaError;
use crate::formats::ncz::NczError;
use crate::formats::ticket::TicketError;
use crate::ids::{ContentId, RightsId};
use crate::ncm::StoreError;
use crate::source::SourceError;
use snafu::Snafu;

#[derive(Snafu, Debug)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// Failed to read from the byte source
    Source { source: SourceError },
    /// The file is not a supported container (nsp/nsz/xci/xcz)
    ContainerNotFound,
    /// Failed to open the outer container
    Container { source: ContainerError },
    /// Ticket entry {name} has no matching .cert entry
    CertNotFound { name: String },
    /// A content requires a ticket for rights id {rights_id} that the container does not provide
    TicketNotFound { rights_id: RightsId },
    /// Referenced content {name} is not in the container
    NcaNotFound { name: String },
    /// NCA processing failed
    Nca { source: NcaError },
    /// Produced NCA hash does not match its content id: expected {expected}, got {actual}
    InvalidNcaSha256 {
        expected: ContentId,
        actual: ContentId,
    },
    /// The NCZ section table is empty
    InvalidNczSectionCount,
    /// Failed to parse the NCZ tables
    Ncz { source: NczError },
    /// No NCZ section covers produced offset {offset}
    NczSectionNotFound { offset: i64 },
    /// No NCZ block covers source offset {offset}
    NczBlockNotFound { offset: i64 },
    /// Zstd decompression failed: {message}
    NczZstd { message: String },
    /// Meta record blob has a corrupt header
    NcmDbCorruptHeader,
    /// Meta record blob has corrupt content infos
    NcmDbCorruptInfos,
    /// The install was cancelled
    Cancelled,
    /// Unwound after another pipeline stage failed
    CancelledByPeer,
    /// Content store or meta database failure
    Store { source: StoreError },
    /// Failed to read back the extracted meta NCA
    MetaReadback { source: std::io::Error },
    /// Failed to parse the packaged content meta
    Cnmt { source: CnmtError },
    /// Failed to parse or patch a ticket
    Ticket { source: TicketError },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
