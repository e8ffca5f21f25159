//! Per-Port Channel Estimation
//!
//! Raw channel estimates exist only at the pilot lattice, which is
//! hexagonal for ports 0/1 (alternating subcarrier shifts between pilot
//! symbols). Estimates are first noise-filtered by averaging each pilot
//! with its lattice neighbors, then interpolated to every resource element
//! by marching triangles over each pair of adjacent pilot rows and
//! evaluating the plane through each triangle's vertices. At lattice
//! points the interpolation reproduces the filtered estimate exactly.

use crate::rs::RsDl;
use crate::N_SC_GRID;
use ndarray::Array2;
use num_complex::Complex64;
use tracing::debug;

/// Channel estimate for one antenna port over the full grid, with the
/// noise power of the raw pilot estimates.
pub struct PortChannel {
    pub ce: Array2<Complex64>,
    pub np: f64,
}

/// Grid rows carrying pilots for the given port.
pub(crate) fn rs_rows(n_symb_dl: usize, n_ofdm: usize, port: u8) -> Vec<usize> {
    let mut rows = Vec::new();
    if port <= 1 {
        let mut r = 0;
        while r < n_ofdm {
            rows.push(r);
            r += n_symb_dl;
        }
        let mut r = n_symb_dl - 3;
        while r < n_ofdm {
            rows.push(r);
            r += n_symb_dl;
        }
        rows.sort_unstable();
    } else {
        let mut r = 1;
        while r < n_ofdm {
            rows.push(r);
            r += n_symb_dl;
        }
    }
    rows
}

/// Average each raw estimate with its hexagonal lattice neighbors.
///
/// With pilot columns laid out as
/// ```text
/// 1   2   3   4   5   6
///   7   8   9   A   B
/// C   D   E   F   G   H
/// ```
/// the filtered estimate for position 8 averages 2, 3, 7, 8, 9, D and E.
pub(crate) fn hex_filter(ce_raw: &Array2<Complex64>, shift: [usize; 2]) -> Array2<Complex64> {
    let n_rs_ofdm = ce_raw.nrows();
    let mut ce_filt = Array2::<Complex64>::zeros((n_rs_ofdm, 12));
    let mut current_row_leftmost = shift[0] < shift[1];
    for t in 0..n_rs_ofdm {
        for k in 0..12i64 {
            let same: Vec<i64> = (k - 1..=k + 1).filter(|&i| (0..12).contains(&i)).collect();
            let adj_range = if shift[0] == shift[1] {
                (k - 1, k + 1)
            } else if current_row_leftmost {
                (k - 1, k)
            } else {
                (k, k + 1)
            };
            let adj: Vec<i64> = (adj_range.0..=adj_range.1)
                .filter(|&i| (0..12).contains(&i))
                .collect();

            let mut total = Complex64::default();
            let mut n_total = 0usize;
            for &i in &same {
                total += ce_raw[(t, i as usize)];
                n_total += 1;
            }
            if t > 0 {
                for &i in &adj {
                    total += ce_raw[(t - 1, i as usize)];
                    n_total += 1;
                }
            }
            if t + 1 < n_rs_ofdm {
                for &i in &adj {
                    total += ce_raw[(t + 1, i as usize)];
                    n_total += 1;
                }
            }
            ce_filt[(t, k as usize)] = total / n_total as f64;
        }
        current_row_leftmost = !current_row_leftmost;
    }
    ce_filt
}

/// Linear interpolation of `(xs, ys)` onto integer positions `0..n`.
fn interp1(xs: &[f64], ys: &[Complex64], n: usize) -> Vec<Complex64> {
    let mut out = Vec::with_capacity(n);
    let mut seg = 0usize;
    for q in 0..n {
        let x = q as f64;
        while seg + 2 < xs.len() && x > xs[seg + 1] {
            seg += 1;
        }
        let (x0, x1) = (xs[seg], xs[seg + 1]);
        let frac = (x - x0) / (x1 - x0);
        out.push(ys[seg] + (ys[seg + 1] - ys[seg]) * frac);
    }
    out
}

/// Extend a pilot row to guaranteed vertices at subcarriers 0 and 71 by
/// linear extrapolation of the edge samples.
fn extend_row(row_x: &mut Vec<f64>, row_val: &mut Vec<Complex64>) {
    if row_x[0] != 0.0 {
        let v = row_val[0] - (row_val[1] - row_val[0]) * (row_x[0] / (row_x[1] - row_x[0]));
        row_val.insert(0, v);
        row_x.insert(0, 0.0);
    }
    let len = row_x.len();
    if row_x[len - 1] != 71.0 {
        let v = row_val[len - 1]
            + (row_val[len - 1] - row_val[len - 2])
                * ((71.0 - row_x[len - 1]) / (row_x[len - 1] - row_x[len - 2]));
        row_val.push(v);
        row_x.push(71.0);
    }
}

#[derive(Clone, Copy)]
struct Vertex {
    x_sc: f64,
    y_symnum: f64,
    val: Complex64,
}

/// Interpolate the filtered estimates onto the full grid by triangulating
/// the space between each pair of adjacent pilot rows.
pub(crate) fn interp_hex(
    ce_filt: &Array2<Complex64>,
    shift: [usize; 2],
    n_ofdm: usize,
    rs_set: &[usize],
) -> Array2<Complex64> {
    let n_rs_ofdm = rs_set.len();
    let mut ce_tfg = Array2::<Complex64>::zeros((n_ofdm, N_SC_GRID));

    for t in 0..n_rs_ofdm - 1 {
        let row_xs = |r: usize| -> Vec<f64> {
            let s = shift[r & 1];
            (0..12).map(|i| (s + 6 * i) as f64).collect()
        };
        let mut top_row_x = row_xs(t);
        let mut top_row_val: Vec<Complex64> = (0..12).map(|i| ce_filt[(t, i)]).collect();
        extend_row(&mut top_row_x, &mut top_row_val);
        let mut bot_row_x = row_xs(t + 1);
        let mut bot_row_val: Vec<Complex64> = (0..12).map(|i| ce_filt[(t + 1, i)]).collect();
        extend_row(&mut bot_row_x, &mut bot_row_val);

        // The first pilot row has no row above it to march from.
        if t == 0 {
            let interp = interp1(&top_row_x, &top_row_val, N_SC_GRID);
            for (c, v) in interp.into_iter().enumerate() {
                ce_tfg[(rs_set[0], c)] = v;
            }
        }

        let y_top = rs_set[t] as f64;
        let y_bot = rs_set[t + 1] as f64;
        let vert = |x: f64, y: f64, v: Complex64| Vertex {
            x_sc: x,
            y_symnum: y,
            val: v,
        };
        let mut top_used;
        let mut bot_used;
        let mut tri: [Vertex; 3];
        if top_row_x[1] < bot_row_x[1] {
            tri = [
                vert(top_row_x[0], y_top, top_row_val[0]),
                vert(bot_row_x[0], y_bot, bot_row_val[0]),
                vert(top_row_x[1], y_top, top_row_val[1]),
            ];
            top_used = 1;
            bot_used = 0;
        } else {
            tri = [
                vert(bot_row_x[0], y_bot, bot_row_val[0]),
                vert(top_row_x[0], y_top, top_row_val[0]),
                vert(bot_row_x[1], y_bot, bot_row_val[1]),
            ];
            top_used = 0;
            bot_used = 1;
        }

        let spacing = rs_set[t + 1] - rs_set[t];
        let mut x_offset = vec![0usize; spacing + 1];
        loop {
            // Plane through the triangle: val = a_p*x + b_p*y + c_p.
            // The coordinates are real, so the system solves by Cramer's
            // rule with a real determinant.
            let (x0, y0) = (tri[0].x_sc, tri[0].y_symnum);
            let (x1, y1) = (tri[1].x_sc, tri[1].y_symnum);
            let (x2, y2) = (tri[2].x_sc, tri[2].y_symnum);
            let det = x0 * (y1 - y2) - y0 * (x1 - x2) + (x1 * y2 - x2 * y1);
            let a_p = (tri[0].val * (y1 - y2) + tri[1].val * (y2 - y0) + tri[2].val * (y0 - y1))
                / det;
            let b_p = (tri[0].val * (x2 - x1) + tri[1].val * (x0 - x2) + tri[2].val * (x1 - x0))
                / det;
            let c_p = (tri[0].val * (x1 * y2 - x2 * y1)
                + tri[1].val * (x2 * y0 - x0 * y2)
                + tri[2].val * (x0 * y1 - x1 * y0))
                / det;

            // Rightmost edge of the triangle: x = a_l*y + b_l.
            let a_l = (x1 - x2) / (y1 - y2);
            let b_l = (y1 * x2 - y2 * x1) / (y1 - y2);

            for r in 1..=spacing {
                let y = (rs_set[t] + r) as f64;
                while x_offset[r] < N_SC_GRID && (x_offset[r] as f64) <= a_l * y + b_l {
                    let x = x_offset[r] as f64;
                    ce_tfg[(rs_set[t] + r, x_offset[r])] = a_p * x + b_p * y + c_p;
                    x_offset[r] += 1;
                }
            }

            if x_offset[1] == N_SC_GRID && x_offset[spacing] == N_SC_GRID {
                break;
            }

            // Advance to the next triangle, pulling a vertex from whichever
            // row the last vertex did not come from.
            tri[0] = tri[1];
            tri[1] = tri[2];
            if tri[1].y_symnum == y_top {
                bot_used += 1;
                tri[2] = vert(bot_row_x[bot_used], y_bot, bot_row_val[bot_used]);
            } else {
                top_used += 1;
                tri[2] = vert(top_row_x[top_used], y_top, top_row_val[top_used]);
            }
        }
    }

    // Rows outside the pilot span copy the nearest pilot row.
    for t in 0..rs_set[0] {
        for c in 0..N_SC_GRID {
            ce_tfg[(t, c)] = ce_tfg[(rs_set[0], c)];
        }
    }
    for t in rs_set[n_rs_ofdm - 1] + 1..n_ofdm {
        for c in 0..N_SC_GRID {
            ce_tfg[(t, c)] = ce_tfg[(rs_set[n_rs_ofdm - 1], c)];
        }
    }
    ce_tfg
}

/// Estimate the channel for one antenna port over the whole grid.
pub fn chan_est(rs_dl: &RsDl, tfg: &Array2<Complex64>, port: u8) -> PortChannel {
    let n_symb_dl = rs_dl.cp_type().n_symb_dl();
    let n_ofdm = tfg.nrows();
    let rs_set = rs_rows(n_symb_dl, n_ofdm, port);
    let n_rs_ofdm = rs_set.len();

    // Raw estimates: compensate the known pilot symbols.
    let mut ce_raw = Array2::<Complex64>::zeros((n_rs_ofdm, 12));
    let mut shift = [0usize; 2];
    let mut slot_num = 0usize;
    for (t, &row) in rs_set.iter().enumerate() {
        let sym_num = row % n_symb_dl;
        let sh = rs_dl.get_shift(slot_num % 20, sym_num, port);
        if t <= 1 {
            shift[t] = sh;
        }
        let rs = rs_dl
            .get_rs(slot_num % 20, sym_num)
            .unwrap_or_else(|| panic!("no pilots in symbol {sym_num}"));
        for i in 0..12 {
            ce_raw[(t, i)] = tfg[(row, sh + 6 * i)] * rs[i].conj();
        }
        if t & 1 == 1 || port >= 2 {
            slot_num = (slot_num + 1) % 20;
        }
    }

    let ce_filt = hex_filter(&ce_raw, shift);

    let resid: Vec<Complex64> = ce_filt
        .iter()
        .zip(ce_raw.iter())
        .map(|(f, r)| f - r)
        .collect();
    let np = common::utils::sigpower(&resid);

    let ce = interp_hex(&ce_filt, shift, n_ofdm, &rs_set);
    debug!(port, np, "channel estimated");
    PortChannel { ce, np }
}
