use crate::error::ProtocolError;
use crate::protocol::ProtocolVersion;

/// Operation codes, client to server. Numeric assignments are stable across
/// all protocol versions; removed operations keep their numbers reserved.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    IsValidPath = 1,
    HasSubstitutes = 3,
    QueryPathHash = 4,   // removed
    QueryReferences = 5, // removed
    QueryReferrers = 6,
    AddToStore = 7,
    AddTextToStore = 8, // removed
    BuildPaths = 9,
    EnsurePath = 10,
    AddTempRoot = 11,
    AddIndirectRoot = 12,
    SyncWithGC = 13,
    FindRoots = 14,
    ExportPath = 16,   // removed
    QueryDeriver = 18, // removed
    SetOptions = 19,
    CollectGarbage = 20,
    QuerySubstitutablePathInfo = 21,
    QueryDerivationOutputs = 22, // removed
    QueryAllValidPaths = 23,
    QueryFailedPaths = 24,  // removed
    ClearFailedPaths = 25,  // removed
    QueryPathInfo = 26,
    ImportPaths = 27,                // removed
    QueryDerivationOutputNames = 28, // removed
    QueryPathFromHashPart = 29,
    QuerySubstitutablePathInfos = 30,
    QueryValidPaths = 31,
    QuerySubstitutablePaths = 32,
    QueryValidDerivers = 33,
    OptimiseStore = 34,
    VerifyStore = 35,
    BuildDerivation = 36,
    AddSignatures = 37,
    NarFromPath = 38,
    AddToStoreNar = 39,
    QueryMissing = 40,
    QueryDerivationOutputMap = 41,
    RegisterDrvOutput = 42,
    QueryRealisation = 43,
    AddMultipleToStore = 44,
    AddBuildLog = 45,
    BuildPathsWithResults = 46,
    AddPermRoot = 47,
    InitCallback = 48,
}

impl OpCode {
    /// Whether the operation has been removed from the protocol. The codes
    /// stay reserved but must never be dispatched.
    pub fn is_removed(&self) -> bool {
        matches!(
            self,
            OpCode::QueryPathHash
                | OpCode::QueryReferences
                | OpCode::AddTextToStore
                | OpCode::ExportPath
                | OpCode::QueryDeriver
                | OpCode::QueryDerivationOutputs
                | OpCode::QueryFailedPaths
                | OpCode::ClearFailedPaths
                | OpCode::ImportPaths
                | OpCode::QueryDerivationOutputNames
        )
    }

    /// The minor version that introduced the operation. Sending it to a
    /// server that predates this is a protocol error.
    pub fn min_minor(&self) -> u8 {
        match self {
            OpCode::QueryValidPaths => 12,
            OpCode::NarFromPath | OpCode::AddToStoreNar => 17,
            OpCode::QueryMissing => 19,
            OpCode::QueryDerivationOutputMap => 22,
            OpCode::AddToStore => 25,
            OpCode::RegisterDrvOutput | OpCode::QueryRealisation => 27,
            OpCode::AddMultipleToStore | OpCode::AddBuildLog => 32,
            OpCode::BuildPathsWithResults => 34,
            OpCode::AddPermRoot => 36,
            OpCode::InitCallback => 38,
            _ => 10,
        }
    }

    /// Check availability at the negotiated version.
    pub fn check_version(&self, version: ProtocolVersion) -> Result<(), ProtocolError> {
        let required = ProtocolVersion::from_parts(1, self.min_minor());
        if version < required {
            return Err(ProtocolError::OpCodeTooNew {
                op: *self as u64,
                required,
                negotiated: version,
            });
        }
        Ok(())
    }
}

impl TryFrom<u64> for OpCode {
    type Error = ProtocolError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::IsValidPath),
            3 => Ok(Self::HasSubstitutes),
            4 => Ok(Self::QueryPathHash),
            5 => Ok(Self::QueryReferences),
            6 => Ok(Self::QueryReferrers),
            7 => Ok(Self::AddToStore),
            8 => Ok(Self::AddTextToStore),
            9 => Ok(Self::BuildPaths),
            10 => Ok(Self::EnsurePath),
            11 => Ok(Self::AddTempRoot),
            12 => Ok(Self::AddIndirectRoot),
            13 => Ok(Self::SyncWithGC),
            14 => Ok(Self::FindRoots),
            16 => Ok(Self::ExportPath),
            18 => Ok(Self::QueryDeriver),
            19 => Ok(Self::SetOptions),
            20 => Ok(Self::CollectGarbage),
            21 => Ok(Self::QuerySubstitutablePathInfo),
            22 => Ok(Self::QueryDerivationOutputs),
            23 => Ok(Self::QueryAllValidPaths),
            24 => Ok(Self::QueryFailedPaths),
            25 => Ok(Self::ClearFailedPaths),
            26 => Ok(Self::QueryPathInfo),
            27 => Ok(Self::ImportPaths),
            28 => Ok(Self::QueryDerivationOutputNames),
            29 => Ok(Self::QueryPathFromHashPart),
            30 => Ok(Self::QuerySubstitutablePathInfos),
            31 => Ok(Self::QueryValidPaths),
            32 => Ok(Self::QuerySubstitutablePaths),
            33 => Ok(Self::QueryValidDerivers),
            34 => Ok(Self::OptimiseStore),
            35 => Ok(Self::VerifyStore),
            36 => Ok(Self::BuildDerivation),
            37 => Ok(Self::AddSignatures),
            38 => Ok(Self::NarFromPath),
            39 => Ok(Self::AddToStoreNar),
            40 => Ok(Self::QueryMissing),
            41 => Ok(Self::QueryDerivationOutputMap),
            42 => Ok(Self::RegisterDrvOutput),
            43 => Ok(Self::QueryRealisation),
            44 => Ok(Self::AddMultipleToStore),
            45 => Ok(Self::AddBuildLog),
            46 => Ok(Self::BuildPathsWithResults),
            47 => Ok(Self::AddPermRoot),
            48 => Ok(Self::InitCallback),
            _ => Err(ProtocolError::InvalidOpCode(value)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removed_codes_are_reserved() {
        for code in [4u64, 5, 8, 16, 18, 27, 28] {
            assert!(OpCode::try_from(code).unwrap().is_removed());
        }
        assert!(!OpCode::IsValidPath.is_removed());
    }

    #[test]
    fn unknown_codes_are_rejected() {
        assert!(OpCode::try_from(0).is_err());
        assert!(OpCode::try_from(15).is_err());
        assert!(OpCode::try_from(49).is_err());
    }

    #[test]
    fn version_gating() {
        let v21 = ProtocolVersion::from_parts(1, 21);
        assert!(OpCode::IsValidPath.check_version(v21).is_ok());
        assert!(OpCode::BuildPathsWithResults.check_version(v21).is_err());
        assert!(
            OpCode::BuildPathsWithResults
                .check_version(ProtocolVersion::from_parts(1, 34))
                .is_ok()
        );
    }
}
