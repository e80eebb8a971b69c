//! Derivative-free minimisation for the ARMA likelihood search.

#[derive(Debug, Clone)]
pub struct Minimum {
    pub x: Vec<f64>,
    pub value: f64,
    pub iterations: usize,
    pub converged: bool,
}

/// Nelder–Mead simplex search started from `x0` with edge length `step`.
///
/// Converges when the spread of objective values across the simplex drops
/// below `tolerance * (1 + |best|)`. Non-finite objective values are treated
/// as `+inf`, which keeps the search inside the feasible region.
pub fn nelder_mead<F>(
    mut objective: F,
    x0: &[f64],
    step: f64,
    max_iterations: usize,
    tolerance: f64,
) -> Minimum
where
    F: FnMut(&[f64]) -> f64,
{
    let mut eval = |x: &[f64]| {
        let value = objective(x);
        if value.is_finite() {
            value
        } else {
            f64::INFINITY
        }
    };

    let n = x0.len();
    if n == 0 {
        return Minimum {
            x: Vec::new(),
            value: eval(x0),
            iterations: 0,
            converged: true,
        };
    }

    let mut simplex: Vec<Vec<f64>> = Vec::with_capacity(n + 1);
    simplex.push(x0.to_vec());
    for i in 0..n {
        let mut vertex = x0.to_vec();
        vertex[i] += step;
        simplex.push(vertex);
    }
    let mut values: Vec<f64> = simplex.iter().map(|x| eval(x)).collect();

    let mut iterations = 0;
    let mut converged = false;

    while iterations < max_iterations {
        iterations += 1;

        let mut order: Vec<usize> = (0..=n).collect();
        order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));
        simplex = order.iter().map(|&i| simplex[i].clone()).collect();
        values = order.iter().map(|&i| values[i]).collect();

        let best = values[0];
        let worst = values[n];
        if best.is_finite() && (worst - best).abs() <= tolerance * (1.0 + best.abs()) {
            converged = true;
            break;
        }

        let centroid: Vec<f64> = (0..n)
            .map(|j| simplex[..n].iter().map(|x| x[j]).sum::<f64>() / n as f64)
            .collect();
        let along = |coef: f64| -> Vec<f64> {
            centroid
                .iter()
                .zip(&simplex[n])
                .map(|(c, w)| c + coef * (c - w))
                .collect()
        };

        let reflected = along(1.0);
        let reflected_value = eval(&reflected);

        if reflected_value < values[0] {
            let expanded = along(2.0);
            let expanded_value = eval(&expanded);
            if expanded_value < reflected_value {
                simplex[n] = expanded;
                values[n] = expanded_value;
            } else {
                simplex[n] = reflected;
                values[n] = reflected_value;
            }
            continue;
        }

        if reflected_value < values[n - 1] {
            simplex[n] = reflected;
            values[n] = reflected_value;
            continue;
        }

        let (contracted, contracted_value) = if reflected_value < values[n] {
            let outside = along(0.5);
            let value = eval(&outside);
            (outside, value)
        } else {
            let inside = along(-0.5);
            let value = eval(&inside);
            (inside, value)
        };

        if contracted_value < values[n].min(reflected_value) {
            simplex[n] = contracted;
            values[n] = contracted_value;
            continue;
        }

        // Shrink toward the best vertex.
        let best_vertex = simplex[0].clone();
        for i in 1..=n {
            simplex[i] = best_vertex
                .iter()
                .zip(&simplex[i])
                .map(|(b, x)| b + 0.5 * (x - b))
                .collect();
            values[i] = eval(&simplex[i]);
        }
    }

    let (best_index, _) = values
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))
        .unwrap_or((0, &f64::INFINITY));

    Minimum {
        x: simplex[best_index].clone(),
        value: values[best_index],
        iterations,
        converged,
    }
}

/// Central-difference Hessian of `f` at `x`.
pub fn numerical_hessian<F>(mut f: F, x: &[f64]) -> Vec<Vec<f64>>
where
    F: FnMut(&[f64]) -> f64,
{
    let n = x.len();
    let steps: Vec<f64> = x.iter().map(|v| 1e-4 * v.abs().max(1e-2)).collect();
    let f0 = f(x);
    let mut hessian = vec![vec![0.0; n]; n];
    let mut point = x.to_vec();

    for i in 0..n {
        let hi = steps[i];
        point[i] = x[i] + hi;
        let plus = f(&point);
        point[i] = x[i] - hi;
        let minus = f(&point);
        point[i] = x[i];
        hessian[i][i] = (plus - 2.0 * f0 + minus) / (hi * hi);

        for j in (i + 1)..n {
            let hj = steps[j];
            let mut corner = |si: f64, sj: f64| {
                point[i] = x[i] + si * hi;
                point[j] = x[j] + sj * hj;
                let value = f(&point);
                point[i] = x[i];
                point[j] = x[j];
                value
            };
            let value = (corner(1.0, 1.0) - corner(1.0, -1.0) - corner(-1.0, 1.0)
                + corner(-1.0, -1.0))
                / (4.0 * hi * hj);
            hessian[i][j] = value;
            hessian[j][i] = value;
        }
    }
    hessian
}
