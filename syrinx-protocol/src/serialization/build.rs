//! Wire forms of build modes and build results.
//!
//! The build result record grew by accretion: 1.27 carries only status and
//! error message, 1.28 appends the built outputs, 1.29 the bookkeeping
//! block, 1.37 the CPU times. Each minor reads and writes exactly the
//! fields valid at that minor.

use std::collections::BTreeMap;

use syrinx_store_core::{
    BuildMode, BuildOutcome, BuildResult, BuildStatus, DerivedPath, DrvOutput, KeyedBuildResult,
    Realisation, StoreDir,
};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::ProtocolError;
use crate::protocol::ProtocolVersion;
use crate::serialization::{Deserialize, Serialize};

impl Serialize for BuildMode {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<(), ProtocolError> {
        (*self as u64).serialize(writer, version, store_dir).await
    }
}

impl Deserialize for BuildMode {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<Self, ProtocolError> {
        let raw = u64::deserialize(reader, version, store_dir).await?;
        BuildMode::try_from(raw).map_err(|_| ProtocolError::bad_value("build mode", raw))
    }
}

impl Serialize for BuildResult {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<(), ProtocolError> {
        let (status, error_msg, non_det) = match &self.outcome {
            BuildOutcome::Success { status, .. } => (*status, "", false),
            BuildOutcome::Failure {
                status,
                error_msg,
                is_non_deterministic,
            } => (*status, error_msg.as_str(), *is_non_deterministic),
        };
        (status as u64).serialize(writer, version, store_dir).await?;
        error_msg.serialize(writer, version, store_dir).await?;
        if version.minor >= 29 {
            self.times_built.serialize(writer, version, store_dir).await?;
            non_det.serialize(writer, version, store_dir).await?;
            self.start_time.serialize(writer, version, store_dir).await?;
            self.stop_time.serialize(writer, version, store_dir).await?;
        }
        if version.minor >= 37 {
            self.cpu_user.serialize(writer, version, store_dir).await?;
            self.cpu_system.serialize(writer, version, store_dir).await?;
        }
        if version.minor >= 28 {
            let built_outputs = match &self.outcome {
                BuildOutcome::Success { built_outputs, .. } => built_outputs
                    .values()
                    .map(|r| (r.id.clone(), r.clone()))
                    .collect(),
                BuildOutcome::Failure { .. } => BTreeMap::<DrvOutput, Realisation>::new(),
            };
            built_outputs.serialize(writer, version, store_dir).await?;
        }
        Ok(())
    }
}

impl Deserialize for BuildResult {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<Self, ProtocolError> {
        let raw_status = u64::deserialize(reader, version, store_dir).await?;
        let status = BuildStatus::try_from(raw_status)
            .map_err(|_| ProtocolError::bad_value("build status", raw_status))?;
        let error_msg = String::deserialize(reader, version, store_dir).await?;

        let (times_built, is_non_deterministic, start_time, stop_time) = if version.minor >= 29 {
            (
                u64::deserialize(reader, version, store_dir).await?,
                bool::deserialize(reader, version, store_dir).await?,
                u64::deserialize(reader, version, store_dir).await?,
                u64::deserialize(reader, version, store_dir).await?,
            )
        } else {
            (0, false, 0, 0)
        };

        let (cpu_user, cpu_system) = if version.minor >= 37 {
            (
                Option::<u64>::deserialize(reader, version, store_dir).await?,
                Option::<u64>::deserialize(reader, version, store_dir).await?,
            )
        } else {
            (None, None)
        };

        let built_outputs = if version.minor >= 28 {
            let by_id = BTreeMap::<DrvOutput, Realisation>::deserialize(reader, version, store_dir)
                .await?;
            by_id
                .into_values()
                .map(|r| (r.id.output_name.clone(), r))
                .collect()
        } else {
            BTreeMap::new()
        };

        let outcome = if status.is_success() {
            BuildOutcome::Success {
                status,
                built_outputs,
            }
        } else {
            BuildOutcome::Failure {
                status,
                error_msg,
                is_non_deterministic,
            }
        };
        Ok(BuildResult {
            outcome,
            times_built,
            start_time,
            stop_time,
            cpu_user,
            cpu_system,
        })
    }
}

impl Serialize for KeyedBuildResult {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<(), ProtocolError> {
        self.path.serialize(writer, version, store_dir).await?;
        self.result.serialize(writer, version, store_dir).await
    }
}

impl Deserialize for KeyedBuildResult {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<Self, ProtocolError> {
        Ok(KeyedBuildResult {
            path: DerivedPath::deserialize(reader, version, store_dir).await?,
            result: BuildResult::deserialize(reader, version, store_dir).await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use syrinx_store_core::StorePath;
    use std::io::Cursor;

    fn failure() -> BuildResult {
        BuildResult::new(BuildOutcome::failure(
            BuildStatus::OutputRejected,
            "no idea why",
        ))
    }

    fn success() -> BuildResult {
        let r = Realisation {
            id: DrvOutput::parse("sha256-b4afnqKCO9oWXgYHb9DeQ2berSwOjS27rSd9TxXDc/U=!foo")
                .unwrap(),
            out_path: StorePath::from_base_name("g1w7hy3qg1w7hy3qg1w7hy3qg1w7hy3q-foo").unwrap(),
            signatures: Default::default(),
            dependent_realisations: Default::default(),
        };
        let mut result = BuildResult::new(BuildOutcome::Success {
            status: BuildStatus::Built,
            built_outputs: [("foo".to_owned(), r)].into(),
        });
        result.times_built = 1;
        result.start_time = 30;
        result.stop_time = 50;
        result
    }

    async fn round_trip_at(value: BuildResult, version: ProtocolVersion) -> BuildResult {
        let dir = StoreDir::default();
        let mut buf = Vec::new();
        value.serialize(&mut buf, version, &dir).await.unwrap();
        let mut cursor = Cursor::new(buf);
        BuildResult::deserialize(&mut cursor, version, &dir)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn failure_round_trip_1_27() {
        let v = ProtocolVersion::from_parts(1, 27);
        let back = round_trip_at(failure(), v).await;
        assert_eq!(back.outcome, failure().outcome);
        // Bookkeeping does not exist at 1.27.
        assert_eq!(back.times_built, 0);
    }

    #[tokio::test]
    async fn success_round_trip_modern() {
        for minor in [28, 29, 37, 38] {
            let v = ProtocolVersion::from_parts(1, minor);
            let back = round_trip_at(success(), v).await;
            match back.outcome {
                BuildOutcome::Success { built_outputs, .. } => {
                    assert_eq!(built_outputs.len(), 1);
                    assert!(built_outputs.contains_key("foo"));
                }
                BuildOutcome::Failure { .. } => panic!("expected success"),
            }
            if minor >= 29 {
                assert_eq!(back.times_built, 1);
                assert_eq!((back.start_time, back.stop_time), (30, 50));
            }
        }
    }

    #[tokio::test]
    async fn cpu_times_only_at_1_37() {
        let mut result = failure();
        result.cpu_user = Some(500_000_000);
        result.cpu_system = Some(604_000_000);
        let back = round_trip_at(result.clone(), ProtocolVersion::from_parts(1, 29)).await;
        assert_eq!(back.cpu_user, None);
        let back = round_trip_at(result, ProtocolVersion::from_parts(1, 37)).await;
        assert_eq!(back.cpu_user, Some(500_000_000));
        assert_eq!(back.cpu_system, Some(604_000_000));
    }

    #[tokio::test]
    async fn keyed_result_round_trip() {
        let dir = StoreDir::default();
        let keyed = KeyedBuildResult {
            path: DerivedPath::opaque(
                StorePath::from_base_name("g1w7hy3qg1w7hy3qg1w7hy3qg1w7hy3q-xxx").unwrap(),
            ),
            result: failure(),
        };
        let v = ProtocolVersion::from_parts(1, 34);
        let mut buf = Vec::new();
        keyed.serialize(&mut buf, v, &dir).await.unwrap();
        let mut cursor = Cursor::new(buf);
        assert_eq!(
            KeyedBuildResult::deserialize(&mut cursor, v, &dir)
                .await
                .unwrap(),
            keyed
        );
    }
}
