/*
 * Created on Mon Mar 27 2023
 *
 * This file is a part of Workpool
 * Workpool is a free and open-source process-backed task executor written
 * by Sayan Nandan ("the Author") with the vision to contain crash-prone,
 * CPU-bound and runaway workloads without compromising on throughput or
 * reliability.
 *
 * Copyright (c) 2023, Sayan Nandan <ohsayan@outlook.com>
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

//! Helpers shared by the unit tests

use rand::{distributions::Alphanumeric, Rng};

/// Set up the test logger; later calls are no-ops
pub fn init_logger() {
    let _ = env_logger::Builder::new()
        .parse_filters("trace")
        .is_test(true)
        .try_init();
}

/// A random alphanumeric string of the given length
pub fn random_string(rng: &mut impl Rng, l: usize) -> String {
    rng.sample_iter(Alphanumeric).take(l).map(char::from).collect()
}
